//! Rewriting reverse proxy for container registries, code hosts, and model
//! hubs.
//!
//! # Architecture Overview
//!
//! ```text
//!  Client ──▶ net (listener, TLS) ──▶ proxy engine
//!                                        │ internal endpoints
//!                                        │ route match (routing)
//!                                        │ admission gate
//!                                        │ request rewrite
//!                                        ▼
//!                                    transport (dns → dial →
//!                                    TLS fragment → fallback chain)
//!                                        │
//!                                        ▼
//!  Client ◀── response rewrite ◀──── upstream
//!            (rewrite: Location,
//!             WWW-Authenticate)
//!
//!  Cross-cutting: config (schema/loader/validation), lifecycle
//!  (reload swap, signals, shutdown, upstream probes), observability
//!  (tracing, metrics).
//! ```

// Core subsystems
pub mod config;
pub mod net;
pub mod proxy;
pub mod rewrite;
pub mod routing;
pub mod transport;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{MirrorConfig, RuntimeConfig};
pub use lifecycle::Controller;
pub use proxy::ProxyEngine;
