use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbitmq_metrics_demo::app::{self, RunOutcome};
use rabbitmq_metrics_demo::config::Config;

/// Exit status when not every test message arrived before the timeout.
const EXIT_TIMED_OUT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_logging(&config.rust_log) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.redacted_url(),
        "RabbitMQ metrics demo starting"
    );

    match app::run(&config).await {
        Ok(RunOutcome::Complete { .. }) => {
            info!("RabbitMQ metrics demo finished");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::TimedOut { remaining, .. }) => {
            warn!(remaining, "RabbitMQ metrics demo finished without all messages");
            ExitCode::from(EXIT_TIMED_OUT)
        }
        Err(e) => {
            error!(error = %e, "RabbitMQ metrics demo failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(rust_log: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
