//! HTTP surface of the courier broker: wire protocol, caller gates and
//! `courierd` configuration.

pub mod auth;
pub mod config;
pub mod http_server;
pub mod wire;

pub use auth::{build_gate, AgentGate, AnyOf, AuthGate, OpenGate, RequestMeta, TokenGate};
pub use config::{AuthMode, CliOptions, ServerConfig};
pub use http_server::{build_router, run_http, AppState};
pub use wire::{dispatch, RawRequest, Request, ValidationError};
