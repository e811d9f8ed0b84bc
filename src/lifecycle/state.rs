//! Atomically swappable serving state.
//!
//! One [`ActiveState`] is live at a time; requests load it at dispatch and
//! keep their clone until the response body finishes, so a swap never
//! migrates an in-flight request. Reload builds a complete replacement
//! first and keeps the previous state on any failure.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;

use crate::config::{load_runtime, ConfigError, RuntimeConfig};
use crate::lifecycle::startup::{self, ProbeError};
use crate::proxy::ProxyEngine;
use crate::transport::{self, RoundTrip};

/// The tuple serving live traffic.
pub struct ActiveState {
    pub config: Arc<RuntimeConfig>,
    pub transport: Arc<dyn RoundTrip>,
    pub engine: Arc<ProxyEngine>,
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("upstream check failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Owns the live state pointer and the reload procedure.
pub struct Controller {
    current: ArcSwap<ActiveState>,
    config_path: PathBuf,
    metrics_handle: Option<PrometheusHandle>,
    check_upstreams: bool,
}

impl Controller {
    pub fn new(
        config_path: PathBuf,
        runtime: RuntimeConfig,
        metrics_handle: Option<PrometheusHandle>,
        check_upstreams: bool,
    ) -> Self {
        let state = build_state(runtime, metrics_handle.clone());
        Self {
            current: ArcSwap::from_pointee(state),
            config_path,
            metrics_handle,
            check_upstreams,
        }
    }

    /// Lock-free load of the live state.
    pub fn state(&self) -> Arc<ActiveState> {
        self.current.load_full()
    }

    /// Re-read the configuration and swap in a freshly built state. Any
    /// failure leaves the previous state serving. The superseded transport
    /// releases its idle connections once the swap is published.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        let runtime = load_runtime(&self.config_path)?;

        let previous = self.current.load_full();
        if runtime.listen != previous.config.listen {
            tracing::warn!(
                old = %previous.config.listen,
                new = %runtime.listen,
                "listen address is not hot-reloadable; restart to apply"
            );
        }

        let transport = transport::build(&runtime.transport);
        if self.check_upstreams {
            startup::check_upstreams(&runtime, transport.as_ref()).await?;
        }
        let engine = ProxyEngine::new(&runtime, transport.clone(), self.metrics_handle.clone());
        let next = ActiveState {
            config: Arc::new(runtime),
            transport,
            engine: Arc::new(engine),
        };
        let previous = self.current.swap(Arc::new(next));
        previous.transport.release_idle();
        Ok(())
    }
}

fn build_state(runtime: RuntimeConfig, metrics_handle: Option<PrometheusHandle>) -> ActiveState {
    let transport = transport::build(&runtime.transport);
    let engine = ProxyEngine::new(&runtime, transport.clone(), metrics_handle);
    ActiveState {
        config: Arc::new(runtime),
        transport,
        engine: Arc::new(engine),
    }
}
