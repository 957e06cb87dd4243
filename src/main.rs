use clap::Parser;
use termbridge::config::{self, Cli, Command};
use termbridge::error::BridgeResult;
use termbridge::fanout::FanOut;
use termbridge::http;
use termbridge::session::SessionRegistry;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> BridgeResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    tracing::info!(version = termbridge::version::VERSION, "Starting termbridge");

    let registry = SessionRegistry::new(
        config.session.clone(),
        config.ssh.clone(),
        FanOut::default(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let result = http::serve(
        &config.server.listen,
        &config.server.auth_token,
        registry.clone(),
        shutdown.clone(),
    )
    .await;

    // Sessions are torn down after the listener stops accepting work, so
    // no request can race a dying backend.
    registry.shutdown().await;
    tracing::info!("Shutdown complete");
    result
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => tracing::info!("Received ctrl-c"),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received ctrl-c");
        }
        shutdown.cancel();
    });
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
