//! `DevRelay` Server: HTTP RPC relay with session-scoped object registries,
//! overload-resolving action dispatch, and asynchronous call/reply handles.

pub mod app;
pub mod backend;
pub mod delegates;
pub mod network;
pub mod security;
pub mod service;
pub mod session;
pub mod settings;
pub mod telemetry;

pub use app::RelayApp;
pub use network::{relay_router, NetworkConfig, NetworkModule};
pub use service::RelayConfig;
