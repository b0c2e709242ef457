//! Capability → provider+model registry with fallback chains.
//!
//! A pure lookup table: `resolve` returns the primary slot, `resolve_chain`
//! the full assignment order. The registry never retries or walks the
//! chain itself; retry-on-provider-failure policy belongs to callers.

use std::{collections::HashMap, sync::Arc};

use hearth_protocol::Capability;

use crate::LlmProvider;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// One assignment of a capability to a provider and model. Index 0 of a
/// chain is the primary; later entries are fallbacks.
#[derive(Clone)]
pub struct CapabilitySlot {
    pub capability: Capability,
    pub provider: Arc<dyn LlmProvider>,
    pub model: String,
}

impl CapabilitySlot {
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

impl std::fmt::Debug for CapabilitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySlot")
            .field("capability", &self.capability)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .finish()
    }
}

/// Registry of providers and their capability assignments. Built once at
/// startup by the composition root, then shared immutably as `Arc`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    slots: HashMap<Capability, Vec<CapabilitySlot>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a provider by name. Idempotent.
    pub fn register_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn LlmProvider>> {
        self.providers.values()
    }

    /// Append a slot to a capability's chain. Assignment order defines
    /// fallback priority; duplicates create duplicate chain entries.
    pub fn assign(
        &mut self,
        capability: Capability,
        provider_name: &str,
        model: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let provider = self
            .providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(provider_name.to_string()))?;

        self.slots.entry(capability).or_default().push(CapabilitySlot {
            capability,
            provider,
            model: model.into(),
        });
        Ok(())
    }

    /// The primary slot for a capability, if any.
    pub fn resolve(&self, capability: Capability) -> Option<CapabilitySlot> {
        self.slots
            .get(&capability)
            .and_then(|chain| chain.first())
            .cloned()
    }

    /// The full fallback chain in assignment order.
    pub fn resolve_chain(&self, capability: Capability) -> Vec<CapabilitySlot> {
        self.slots.get(&capability).cloned().unwrap_or_default()
    }

    /// Primary (provider, model) per capability, for the read-only
    /// `/models/slots` surface.
    pub fn slot_summary(&self) -> HashMap<Capability, Option<(String, String)>> {
        Capability::ALL
            .iter()
            .map(|cap| {
                let primary = self
                    .resolve(*cap)
                    .map(|slot| (slot.provider_name().to_string(), slot.model.clone()));
                (*cap, primary)
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::pin::Pin;

    use {async_trait::async_trait, tokio_stream::Stream};

    use {
        super::*,
        crate::{ChatMessage, ChatResponse, ModelInfo, StreamEvent},
    };

    struct NamedProvider(&'static str);

    #[async_trait]
    impl LlmProvider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
            Ok(vec![])
        }

        async fn chat(
            &self,
            model: &str,
            _messages: &[ChatMessage],
        ) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: String::new(),
                model: model.to_string(),
                tokens_used: None,
            })
        }

        fn chat_stream(
            &self,
            _model: String,
            _messages: Vec<ChatMessage>,
        ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
            Box::pin(tokio_stream::empty())
        }
    }

    fn registry_with(names: &[&'static str]) -> ProviderRegistry {
        let mut reg = ProviderRegistry::new();
        for name in names {
            reg.register_provider(Arc::new(NamedProvider(name)));
        }
        reg
    }

    #[test]
    fn assign_unknown_provider_fails() {
        let mut reg = registry_with(&["claude"]);
        let err = reg
            .assign(Capability::Language, "missing", "m1")
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownProvider(name) if name == "missing"));
    }

    #[test]
    fn resolve_returns_first_assignment() {
        let mut reg = registry_with(&["claude", "openai"]);
        reg.assign(Capability::Language, "claude", "claude-a").unwrap();
        reg.assign(Capability::Language, "openai", "gpt-b").unwrap();
        reg.assign(Capability::Language, "claude", "claude-c").unwrap();

        let primary = reg.resolve(Capability::Language).unwrap();
        assert_eq!(primary.provider_name(), "claude");
        assert_eq!(primary.model, "claude-a");
    }

    #[test]
    fn resolve_chain_preserves_assignment_order() {
        let mut reg = registry_with(&["claude", "openai"]);
        reg.assign(Capability::Reasoning, "openai", "o1").unwrap();
        reg.assign(Capability::Reasoning, "claude", "claude-r").unwrap();

        let chain = reg.resolve_chain(Capability::Reasoning);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].provider_name(), "openai");
        assert_eq!(chain[1].provider_name(), "claude");
    }

    #[test]
    fn duplicate_assignments_are_not_deduplicated() {
        let mut reg = registry_with(&["claude"]);
        reg.assign(Capability::Language, "claude", "m").unwrap();
        reg.assign(Capability::Language, "claude", "m").unwrap();
        assert_eq!(reg.resolve_chain(Capability::Language).len(), 2);
    }

    #[test]
    fn unassigned_capability_resolves_to_none() {
        let reg = registry_with(&["claude"]);
        assert!(reg.resolve(Capability::Vision).is_none());
        assert!(reg.resolve_chain(Capability::Vision).is_empty());
    }

    #[test]
    fn register_provider_is_idempotent_overwrite() {
        let mut reg = registry_with(&["claude"]);
        reg.register_provider(Arc::new(NamedProvider("claude")));
        assert_eq!(reg.providers().count(), 1);
    }

    #[test]
    fn slot_summary_covers_every_capability() {
        let mut reg = registry_with(&["claude"]);
        reg.assign(Capability::Language, "claude", "m").unwrap();
        let summary = reg.slot_summary();
        assert_eq!(summary.len(), Capability::ALL.len());
        assert_eq!(
            summary[&Capability::Language],
            Some(("claude".to_string(), "m".to_string()))
        );
        assert_eq!(summary[&Capability::Tts], None);
    }
}
