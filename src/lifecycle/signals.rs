//! OS signal handling.
//!
//! # Responsibilities
//! - Translate SIGTERM/ctrl-c into graceful shutdown
//! - Translate SIGHUP into a configuration reload
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers a reload, never a shutdown

/// Resolve when a termination signal (SIGTERM or ctrl-c) arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

/// Stream of SIGHUP deliveries, used to drive reloads. `None` when the
/// handler cannot be installed.
#[cfg(unix)]
pub fn reload_signals() -> Option<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok()
}
