use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use listing_harvester::browser::ChromiumSessions;
use listing_harvester::config::HarvestConfig;
use listing_harvester::notify::SmtpNotifier;
use listing_harvester::orchestrator::Orchestrator;
use listing_harvester::server::{self, AppState};
use listing_harvester::translate::{RigTranslator, Translator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Console plus a daily file under log/; the guard flushes on exit.
    let file_appender = tracing_appender::rolling::daily("log", "harvest.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let config = Arc::new(HarvestConfig::from_env().context("invalid configuration")?);

    eprintln!("Listing harvester v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Submit: http://0.0.0.0:{}/api/submit", config.port);
    eprintln!("   Status: http://0.0.0.0:{}/api/check-status", config.port);
    eprintln!("   Output: {}", config.output_dir.display());

    let translator: Option<Arc<dyn Translator>> = match &config.translator {
        Some(settings) => Some(Arc::new(
            RigTranslator::new(settings).context("failed to build translator")?,
        )),
        None => {
            tracing::warn!("OPENAI_API_KEY not set; AI keyword mode disabled");
            None
        }
    };

    let factory = Arc::new(ChromiumSessions::new(config.browser.clone()));
    let notifier = Arc::new(SmtpNotifier::new(config.notifier.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        factory,
        notifier,
        translator,
    ));

    let state = AppState {
        runner: orchestrator.clone(),
        status: orchestrator,
    };

    tokio::select! {
        result = server::serve(config.port, state) => {
            result.context("API server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
