mod backend;
mod config;
mod driver;
mod ledger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::SyncConfig;
use driver::Driver;
use ledger::{StatusLedger, SyncStatus};

const DEFAULT_CONFIG_PATH: &str = "ferrysync.toml";
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("ferrysync starting");

    let args: Vec<String> = std::env::args().collect();

    // `ferrysync status [config] [key]` reports the ledger and exits
    if args.get(1).map(String::as_str) == Some("status") {
        let config_path = config_path_arg(args.get(2));
        return print_status(&SyncConfig::load(&config_path)?, args.get(3).map(String::as_str));
    }

    let config_path = config_path_arg(args.get(1));
    let config = SyncConfig::load(&config_path)?;

    let source = backend::from_config(&config.source, "source")?;
    let target = backend::from_config(&config.target, "target")?;
    let ledger = match &config.ledger_path {
        Some(path) => {
            let ledger = StatusLedger::open(path)?;
            info!(path = %path.display(), "Status ledger opened");
            Some(Arc::new(ledger))
        }
        None => None,
    };

    let driver = Driver::new(&config, source, target, ledger)?;
    let pool = driver.pool();
    let mut run = tokio::task::spawn_blocking(move || driver.run());
    let mut status_interval = time::interval(STATUS_INTERVAL);
    let mut interrupted = false;
    let mut reload = ControlSignal::install(Control::Reload);
    let mut toggle_pause = ControlSignal::install(Control::TogglePause);

    info!("Sync running. Ctrl+C stops, SIGHUP reloads the thread count, SIGUSR1 toggles pause.");
    let summary = loop {
        tokio::select! {
            result = &mut run => break result??,
            _ = status_interval.tick() => {
                info!(
                    capacity = pool.capacity(),
                    active = pool.active_count(),
                    queued = pool.queued(),
                    unfinished = pool.unfinished_count(),
                    paused = pool.is_paused(),
                    "Pool status"
                );
            }
            _ = signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let discarded = pool.shutdown_now();
                warn!(discarded, "Received shutdown signal; finishing running transfers");
            }
            _ = reload.recv() => {
                match SyncConfig::load(&config_path) {
                    Ok(new) => {
                        if let Err(e) = pool.resize(new.threads) {
                            error!(error = %e, "Resize failed");
                        }
                    }
                    Err(e) => error!(error = %e, "Config reload failed"),
                }
            }
            _ = toggle_pause.recv() => {
                let toggled = if pool.is_paused() { pool.resume() } else { pool.pause() };
                if let Err(e) = toggled {
                    error!(error = %e, "Pause toggle failed");
                }
            }
        }
    };

    if summary.failed > 0 {
        anyhow::bail!("{} of {} objects failed", summary.failed, summary.keys);
    }
    if interrupted {
        anyhow::bail!("Interrupted; {} queued objects were not transferred", summary.cancelled);
    }
    info!("ferrysync stopped");
    Ok(())
}

fn config_path_arg(arg: Option<&String>) -> PathBuf {
    PathBuf::from(arg.cloned().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()))
}

fn print_status(config: &SyncConfig, key: Option<&str>) -> anyhow::Result<()> {
    let Some(path) = &config.ledger_path else {
        anyhow::bail!("No ledger_path configured");
    };
    let ledger = StatusLedger::open(path)?;
    match key {
        Some(key) => match ledger.get(key)? {
            Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
            None => anyhow::bail!("{} has no ledger entry", key),
        },
        None => {
            let counts = serde_json::json!({
                "complete": ledger.count(SyncStatus::Complete)?,
                "skipped": ledger.count(SyncStatus::Skipped)?,
                "failed": ledger.count(SyncStatus::Failed)?,
            });
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
enum Control {
    Reload,
    TogglePause,
}

/// A control signal stream, registered once for the whole run so no
/// delivery falls between two registrations.
#[cfg(unix)]
struct ControlSignal {
    stream: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl ControlSignal {
    fn install(control: Control) -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let kind = match control {
            Control::Reload => SignalKind::hangup(),
            Control::TogglePause => SignalKind::user_defined1(),
        };
        let stream = match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(control = ?control, error = %e, "Failed to install signal handler");
                None
            }
        };
        Self { stream }
    }

    async fn recv(&mut self) {
        match &mut self.stream {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(not(unix))]
struct ControlSignal;

#[cfg(not(unix))]
impl ControlSignal {
    fn install(_control: Control) -> Self {
        ControlSignal
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
