//! certpilot binary
//!
//! - `certpilot run` obtains and renews the certificate while serving TLS
//! - `certpilot check` validates the configuration and prints the result

use certpilot::prelude::*;
use certpilot_acme::{AcmeError, ErrorKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "certpilot")]
#[command(version)]
#[command(about = "ACME certificate lifecycle orchestrator with TLS-ALPN-01 validation")]
struct Cli {
    /// Configuration file (TOML, JSON or .env)
    #[arg(short, long, env = "CERTPILOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve TLS and keep the certificate renewed (default)
    Run,
    /// Load and validate the configuration, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Check => {
            let config = acme_config(&settings)?;
            println!("directory: {}", config.directory_url);
            println!("domains:   {}", config.domains.join(", "));
            println!("listen:    {}", settings.listen_addr);
            Ok(())
        }
        Command::Run => {
            let _guard = LogConfig::from_settings(&settings)?.init()?;
            run(settings).await?;
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> certpilot::Result<()> {
    let config = acme_config(&settings)?;
    let cancel = CancelSignal::new();

    let shared = Arc::new(SharedCertState::new());
    let responder = Arc::new(ChallengeResponder::new(
        shared.clone(),
        vec![b"http/1.1".to_vec()],
    ));
    let server = TlsServer::bind(&settings.listen_addr, responder, shared.clone()).await?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let scheduler = {
        let cancel = cancel.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let transport = match connect(&config, &cancel).await {
                Ok(transport) => transport,
                Err(AcmeError::Cancelled) => return,
                Err(err) => {
                    error!(error = %err, "Giving up on the ACME directory");
                    cancel.cancel();
                    return;
                }
            };
            RenewalScheduler::new(config, transport, shared, cancel)
                .run()
                .await;
        })
    };

    let body = format!("certpilot serving {}\n", settings.domains.join(", "));
    server.serve(StaticResponse::new(body), cancel.clone()).await?;

    cancel.cancel();
    if let Err(err) = scheduler.await {
        warn!(error = %err, "Scheduler task ended abnormally");
    }
    Ok(())
}

/// Resolve the directory, retrying transport failures at the account retry delay
async fn connect(
    config: &AcmeConfig,
    cancel: &CancelSignal,
) -> Result<Arc<HttpTransport>, AcmeError> {
    loop {
        match cancel.guard(HttpTransport::connect(config)).await {
            Ok(transport) => return Ok(Arc::new(transport)),
            Err(err) if err.kind() == ErrorKind::Transport => {
                warn!(
                    error = %err,
                    retry_secs = config.account_retry_delay.as_secs(),
                    "ACME directory unreachable"
                );
                cancel.sleep(config.account_retry_delay).await?;
            }
            Err(err) => return Err(err),
        }
    }
}
