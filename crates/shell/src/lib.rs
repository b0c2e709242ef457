//! Per-tab shell sessions.
//!
//! Each (session, tab) pair owns at most one running process. Output is
//! streamed as it arrives, stdin can be fed incrementally, and every
//! process ends with exactly one exit event, whether it finished, was
//! killed, or hit the execution timeout.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::DashMap,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        process::Command,
        sync::mpsc,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use hearth_protocol::{ShellExitPayload, ShellOutputPayload, StreamName};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_CHUNK_BYTES: usize = 4096;
/// How long a terminated child gets to react to SIGTERM before it is
/// killed outright.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Something a running shell reports back to its connection.
#[derive(Debug, Clone)]
pub enum ShellEvent {
    Output(ShellOutputPayload),
    Exit(ShellExitPayload),
}

/// A shell is keyed by the owning session and the client tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShellKey {
    pub session_id: String,
    pub tab_id: String,
}

impl ShellKey {
    pub fn new(session_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tab_id: tab_id.into(),
        }
    }
}

struct ShellHandle {
    /// Distinguishes this process from a successor under the same key, so
    /// a finished process never evicts its replacement's entry.
    generation: u64,
    cancel: CancellationToken,
    stdin_tx: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
}

impl ShellHandle {
    /// TERM first so the child can clean up; the supervisor escalates to
    /// a hard kill if it lingers past the grace period.
    fn terminate(&self) {
        send_sigterm(self.pid);
        self.cancel.cancel();
    }
}

/// Tracks running shells and enforces the one-process-per-tab rule.
pub struct ShellManager {
    entries: DashMap<ShellKey, ShellHandle>,
    next_generation: AtomicU64,
    timeout: Duration,
}

impl Default for ShellManager {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }
}

impl ShellManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom execution timeout; tests use short ones.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(0),
            timeout,
        }
    }

    /// Start a command for a tab, killing whatever the tab was running
    /// before. Output and the final exit arrive on `events`; a spawn
    /// failure is reported the same way and never bubbles up.
    pub fn exec(
        self: &Arc<Self>,
        key: ShellKey,
        command: String,
        cwd: Option<PathBuf>,
        events: mpsc::UnboundedSender<ShellEvent>,
    ) {
        // Replace-on-exec: the previous process for this tab is signalled
        // before the successor spawns.
        if let Some((_, old)) = self.entries.remove(&key) {
            debug!(tab_id = %key.tab_id, "replacing running shell");
            old.terminate();
        }

        let working_dir = cwd.or_else(default_working_dir);

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd.exe");
            c.arg("/c").arg(&command);
            c
        } else {
            let mut c = Command::new("bash");
            c.arg("-c").arg(&command);
            c
        };
        cmd.env("TERM", "dumb")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(tab_id = %key.tab_id, error = %e, "shell spawn failed");
                let _ = events.send(ShellEvent::Output(ShellOutputPayload {
                    tab_id: key.tab_id.clone(),
                    data: format!("failed to start shell: {e}\n"),
                    stream: StreamName::Stderr,
                }));
                let _ = events.send(ShellEvent::Exit(ShellExitPayload {
                    tab_id: key.tab_id,
                    code: Some(1),
                    signal: None,
                }));
                return;
            },
        };

        info!(
            session_id = %key.session_id,
            tab_id = %key.tab_id,
            command = %command,
            ?working_dir,
            "shell started"
        );

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();

        self.entries.insert(key.clone(), ShellHandle {
            generation,
            cancel: cancel.clone(),
            stdin_tx,
            pid: child.id(),
        });

        // Stdin feeder. Lives until the channel closes or the pipe breaks.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = stdin_rx.recv().await {
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, key.tab_id.clone(), StreamName::Stdout, events.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, key.tab_id.clone(), StreamName::Stderr, events.clone()));

        let manager = Arc::clone(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let pid = child.id();
            let mut cancelled = false;
            let mut timed_out = false;

            let status = tokio::select! {
                status = child.wait() => status.ok(),
                // SIGTERM was already delivered by terminate().
                _ = cancel.cancelled() => {
                    cancelled = true;
                    None
                },
                _ = tokio::time::sleep(timeout) => {
                    timed_out = true;
                    send_sigterm(pid);
                    None
                },
            };

            let status = match status {
                Some(s) => Some(s),
                None => {
                    // TERM is out; give the child its grace period, then
                    // kill and reap for the real exit status.
                    #[cfg(not(unix))]
                    {
                        let _ = child.start_kill();
                    }
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(status) => status.ok(),
                        Err(_) => {
                            warn!(tab_id = %key.tab_id, "shell ignored SIGTERM, killing");
                            let _ = child.start_kill();
                            child.wait().await.ok()
                        },
                    }
                },
            };

            // All output must land before the exit event.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            if timed_out {
                warn!(tab_id = %key.tab_id, timeout_secs = timeout.as_secs(), "shell timed out");
                let _ = events.send(ShellEvent::Output(ShellOutputPayload {
                    tab_id: key.tab_id.clone(),
                    data: format!("\n[timed out after {}s]\n", timeout.as_secs()),
                    stream: StreamName::Stderr,
                }));
            }

            // Free the key before the exit event goes out, and only
            // remove our own entry; a replacement has a newer generation.
            manager
                .entries
                .remove_if(&key, |_, handle| handle.generation == generation);

            let (code, signal) = match status {
                Some(s) => (s.code(), exit_signal(&s)),
                None => (None, None),
            };
            debug!(tab_id = %key.tab_id, ?code, ?signal, cancelled, "shell exited");
            let _ = events.send(ShellEvent::Exit(ShellExitPayload {
                tab_id: key.tab_id,
                code,
                signal,
            }));
        });
    }

    /// Feed stdin to a running shell. No-op when nothing is running.
    pub fn send_input(&self, key: &ShellKey, data: &str) {
        if let Some(handle) = self.entries.get(key) {
            let _ = handle.stdin_tx.send(data.to_string());
        }
    }

    /// Terminate a tab's process. Idempotent; the exit event still
    /// arrives.
    pub fn kill(&self, key: &ShellKey) {
        if let Some((_, handle)) = self.entries.remove(key) {
            info!(tab_id = %key.tab_id, "shell killed");
            handle.terminate();
        }
    }

    /// Kill everything a session owns. Called when its connection closes.
    pub fn cleanup(&self, session_id: &str) {
        let keys: Vec<ShellKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        if !keys.is_empty() {
            info!(session_id, count = keys.len(), "cleaning up session shells");
        }
        for key in keys {
            self.kill(&key);
        }
    }

    /// Kill every running shell. Called on server shutdown.
    pub fn shutdown(&self) {
        let keys: Vec<ShellKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.kill(&key);
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }
}

fn default_working_dir() -> Option<PathBuf> {
    directories::UserDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

fn spawn_reader<R>(
    mut reader: R,
    tab_id: String,
    stream: StreamName,
    events: mpsc::UnboundedSender<ShellEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; OUTPUT_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let payload = ShellOutputPayload {
                        tab_id: tab_id.clone(),
                        data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        stream,
                    };
                    if events.send(ShellEvent::Output(payload)).is_err() {
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

// On Windows the supervisor kills outright; there is no TERM.
#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| match sig {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn manager() -> Arc<ShellManager> {
        Arc::new(ShellManager::new())
    }

    async fn drain_until_exit(
        rx: &mut mpsc::UnboundedReceiver<ShellEvent>,
    ) -> (String, String, ShellExitPayload) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(35), rx.recv())
                .await
                .expect("timed out waiting for shell event")
                .expect("event channel closed before exit")
            {
                ShellEvent::Output(out) => match out.stream {
                    StreamName::Stdout => stdout.push_str(&out.data),
                    StreamName::Stderr => stderr.push_str(&out.data),
                },
                ShellEvent::Exit(exit) => return (stdout, stderr, exit),
            }
        }
    }

    #[tokio::test]
    async fn echo_streams_output_then_exits() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.exec(
            ShellKey::new("s1", "t1"),
            "echo hello; echo err >&2".into(),
            None,
            tx,
        );

        let (stdout, stderr, exit) = drain_until_exit(&mut rx).await;
        assert_eq!(stdout.trim(), "hello");
        assert_eq!(stderr.trim(), "err");
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.tab_id, "t1");
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.exec(ShellKey::new("s1", "t1"), "exit 42".into(), None, tx);
        let (_, _, exit) = drain_until_exit(&mut rx).await;
        assert_eq!(exit.code, Some(42));
    }

    #[tokio::test]
    async fn exec_replaces_running_process_on_same_tab() {
        let mgr = manager();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let key = ShellKey::new("s1", "t1");
        mgr.exec(key.clone(), "sleep 30".into(), None, tx1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mgr.exec(key.clone(), "echo second".into(), None, tx2);

        // The first process is terminated and still gets its exit event.
        let (_, _, exit1) = drain_until_exit(&mut rx1).await;
        assert_eq!(exit1.code, None);
        assert_eq!(exit1.signal.as_deref(), Some("SIGTERM"));

        let (stdout2, _, exit2) = drain_until_exit(&mut rx2).await;
        assert_eq!(stdout2.trim(), "second");
        assert_eq!(exit2.code, Some(0));
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn timeout_emits_diagnostic_and_frees_the_tab() {
        let mgr = Arc::new(ShellManager::with_timeout(Duration::from_millis(200)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = ShellKey::new("s1", "t1");
        mgr.exec(key.clone(), "sleep 30".into(), None, tx);

        let (_, stderr, exit) = drain_until_exit(&mut rx).await;
        assert!(stderr.contains("[timed out after 0s]"));
        assert_eq!(exit.code, None);

        // Tab is reusable after the timeout.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mgr.exec(key, "echo back".into(), None, tx2);
        let (stdout, _, _) = drain_until_exit(&mut rx2).await;
        assert_eq!(stdout.trim(), "back");
    }

    #[tokio::test]
    async fn stdin_reaches_the_process() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = ShellKey::new("s1", "t1");
        mgr.exec(key.clone(), "cat".into(), None, tx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        mgr.send_input(&key, "ping\n");
        let evt = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match evt {
            ShellEvent::Output(out) => assert_eq!(out.data, "ping\n"),
            other => panic!("expected output, got {other:?}"),
        }

        mgr.kill(&key);
        loop {
            match rx.recv().await.unwrap() {
                ShellEvent::Exit(exit) => {
                    assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
                    break;
                },
                ShellEvent::Output(_) => {},
            }
        }
    }

    #[tokio::test]
    async fn spawn_failure_reports_exit_code_one() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.exec(
            ShellKey::new("s1", "t1"),
            "echo hi".into(),
            Some(PathBuf::from("/definitely/not/a/dir")),
            tx,
        );
        let (_, stderr, exit) = drain_until_exit(&mut rx).await;
        assert!(stderr.contains("failed to start shell"));
        assert_eq!(exit.code, Some(1));
        assert_eq!(mgr.live_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_delivers_sigterm_so_trap_handlers_run() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = ShellKey::new("s1", "t1");
        mgr.exec(
            key.clone(),
            "trap 'echo caught; exit 3' TERM; sleep 30 & wait $!".into(),
            None,
            tx,
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        mgr.kill(&key);
        let (stdout, _, exit) = drain_until_exit(&mut rx).await;
        assert!(stdout.contains("caught"));
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    async fn input_to_idle_tab_is_a_no_op() {
        let mgr = manager();
        mgr.send_input(&ShellKey::new("s1", "nothing-here"), "data\n");
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let mgr = manager();
        let key = ShellKey::new("s1", "t1");
        mgr.kill(&key);
        mgr.kill(&key);
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_kills_only_that_sessions_shells() {
        let mgr = manager();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        mgr.exec(ShellKey::new("sess-a", "t1"), "sleep 30".into(), None, tx_a);
        mgr.exec(ShellKey::new("sess-b", "t1"), "sleep 30".into(), None, tx_b);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mgr.live_count(), 2);

        mgr.cleanup("sess-a");
        let (_, _, exit) = drain_until_exit(&mut rx_a).await;
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
        assert_eq!(mgr.live_count(), 1);

        mgr.shutdown();
        let (_, _, _) = drain_until_exit(&mut rx_b).await;
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.exec(
            ShellKey::new("s1", "t1"),
            "pwd".into(),
            Some(dir.path().to_path_buf()),
            tx,
        );
        let (stdout, _, _) = drain_until_exit(&mut rx).await;
        let reported = std::fs::canonicalize(stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }
}
