//! HTTP listener and request dispatch.
//!
//! # Responsibilities
//! - Bind the configured address, plain or TLS
//! - Apply the immutable server-side header timeouts
//! - Dispatch every request through the live [`ActiveState`]
//! - Drain connections on shutdown, bounded by the shutdown timeout
//!
//! The axum router has a single fallback handler: all real routing is
//! longest-prefix matching inside the proxy engine, not axum path routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::config::ServerTimeouts;
use crate::lifecycle::Controller;
use crate::net::tls::{self, TlsError};

/// Peer address of the client connection, attached to each request for the
/// forwarding headers.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid listen address {0:?}")]
    InvalidAddr(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("serve: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the axum app around the live-state controller.
pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(controller)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(
    State(controller): State<Arc<Controller>>,
    mut req: Request<Body>,
) -> Response<Body> {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    if let Some(addr) = client {
        req.extensions_mut().insert(ClientAddr(addr));
    }
    let state = controller.state();
    state.engine.handle(req).await
}

/// Serve until the handle is shut down. The listen address, TLS material,
/// and header timeouts come from the state that is live at startup and are
/// never re-read on reload.
pub async fn serve(controller: Arc<Controller>, handle: Handle) -> Result<(), ServeError> {
    let startup_state = controller.state();
    let cfg = startup_state.config.clone();
    drop(startup_state);

    let addr: SocketAddr = cfg
        .listen
        .parse()
        .map_err(|_| ServeError::InvalidAddr(cfg.listen.clone()))?;
    let app = router(controller);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    tracing::info!(
        address = %addr,
        tls = cfg.tls.is_some(),
        "listener starting"
    );

    match &cfg.tls {
        Some(settings) => {
            let rustls_config = RustlsConfig::from_config(tls::server_config(settings)?);
            let mut server = axum_server::bind_rustls(addr, rustls_config).handle(handle);
            configure_http(server.http_builder(), &cfg.timeouts);
            server.serve(make_service).await?;
        }
        None => {
            let mut server = axum_server::bind(addr).handle(handle);
            configure_http(server.http_builder(), &cfg.timeouts);
            server.serve(make_service).await?;
        }
    }

    tracing::info!("listener stopped");
    Ok(())
}

fn configure_http(
    builder: &mut hyper_util::server::conn::auto::Builder<hyper_util::rt::TokioExecutor>,
    timeouts: &ServerTimeouts,
) {
    let mut http1 = builder.http1();
    http1.timer(TokioTimer::new());
    if timeouts.read_header > Duration::ZERO {
        http1.header_read_timeout(timeouts.read_header);
    }
    http1.max_buf_size(timeouts.max_header_bytes);
    builder.http2().timer(TokioTimer::new());
}
