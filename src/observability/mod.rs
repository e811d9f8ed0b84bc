//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! proxy engine
//!     → logging.rs (structured events, access log)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → /metrics on the proxy listener (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
