//! Parley Gateway - HTTP front end
//!
//! This crate implements the HTTP side of Parley, handling:
//! - The legacy `/api`, `/newid` and `/create` routes
//! - A structured `/v1/chat` route
//! - Health and Prometheus endpoints

pub mod config;
pub mod error;
pub mod metrics;
pub mod router;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use router::{build_routes, AppState};

/// Gateway version
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
