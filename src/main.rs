use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use rmirror::config::{self, build_runtime};
use rmirror::lifecycle::{signals, startup, Controller};
use rmirror::net;
use rmirror::observability::{logging, metrics};
use rmirror::transport;

#[derive(Parser)]
#[command(name = "rmirror")]
#[command(version)]
#[command(about = "Rewriting reverse proxy for registries, code hosts, and model hubs", long_about = None)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the config and exit.
    #[arg(long)]
    validate: bool,

    /// Print the built-in default config to stdout and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Probe every upstream before serving and on each reload.
    #[arg(long)]
    check_upstreams: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_default_config {
        match toml::to_string_pretty(&config::default_config()) {
            Ok(rendered) => {
                println!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("print default config failed: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    logging::init(cli.log_json);

    let runtime = match config::load_config(&cli.config).map(|cfg| build_runtime(&cfg)) {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(errors)) => {
            for error in &errors {
                tracing::error!(error = %error, "invalid config");
            }
            return ExitCode::FAILURE;
        }
        Err(err) => {
            tracing::error!(error = %err, "load config failed");
            return ExitCode::FAILURE;
        }
    };
    if cli.validate {
        tracing::info!("config ok");
        return ExitCode::SUCCESS;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %runtime.listen,
        routes = runtime.routes.len(),
        "startup"
    );

    let metrics_handle = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::error!(error = %err, "metrics recorder unavailable");
            None
        }
    };

    if cli.check_upstreams {
        let probe_transport = transport::build(&runtime.transport);
        tracing::info!("upstream check started");
        if let Err(err) = startup::check_upstreams(&runtime, probe_transport.as_ref()).await {
            tracing::error!(error = %err, "upstream check failed");
            return ExitCode::FAILURE;
        }
        tracing::info!("upstream check ok");
    }

    let shutdown_timeout = runtime.timeouts.shutdown;
    let controller = Arc::new(Controller::new(
        cli.config.clone(),
        runtime,
        metrics_handle,
        cli.check_upstreams,
    ));

    // Reload loop: SIGHUP re-reads the config and swaps the live state.
    #[cfg(unix)]
    if let Some(mut reload) = signals::reload_signals() {
        let controller = controller.clone();
        tokio::spawn(async move {
            while reload.recv().await.is_some() {
                match controller.reload().await {
                    Ok(()) => tracing::info!("reload succeeded"),
                    Err(err) => tracing::error!(error = %err, "reload failed"),
                }
            }
        });
    }

    let handle = axum_server::Handle::new();
    let mut server = tokio::spawn(net::serve(controller, handle.clone()));

    tokio::select! {
        _ = signals::shutdown_signal() => {
            handle.graceful_shutdown(Some(shutdown_timeout));
        }
        result = &mut server => {
            return report_server_exit(result);
        }
    }

    report_server_exit(server.await)
}

fn report_server_exit(
    result: Result<Result<(), net::ServeError>, tokio::task::JoinError>,
) -> ExitCode {
    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(error = %err, "server error");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(error = %err, "server task failed");
            ExitCode::FAILURE
        }
    }
}
