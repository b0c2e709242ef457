//! HTTP + WebSocket gateway: pairing routes, the authenticated REST
//! surface, and the per-connection frame dispatcher.

pub mod chat;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    server::build_router,
    state::GatewayState,
};
