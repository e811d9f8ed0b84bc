//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, typed durations, built routes)
//!     → RuntimeConfig (validated, immutable)
//!     → consumed once by the proxy builder
//!
//! On SIGHUP:
//!     loader.rs loads the file again
//!     → validation.rs validates
//!     → a fresh ActiveState is built and swapped in
//!     → listener address and server timeouts are NOT re-applied;
//!       changing them requires a restart
//! ```

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_runtime, ConfigError};
pub use schema::{default_config, MirrorConfig, RouteConfig};
pub use validation::{
    build_runtime, parse_duration, Limits, RuntimeConfig, ServerTimeouts, TlsSettings,
    TransportSettings, ValidationError,
};
