mod capture;
mod config;
mod heartbeat;
mod lock;
mod observer;
mod probe;
#[cfg(feature = "serve")]
mod serve;
mod signals;
mod staleness;
mod status;
mod supervisor;

use clap::Parser;
use std::path::PathBuf;

/// Keeps an RTSP segmenter alive: spawns it, watches its output directory
/// for finished segments, and restarts it when segments stop arriving.
#[derive(Parser, Debug)]
#[command(name = "segment-watchdog", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watchdog.toml")]
    config: PathBuf,

    /// Stream source URL (overrides config)
    #[arg(short, long)]
    source: Option<String>,

    /// Output directory for segments (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Seconds between staleness checks (overrides config)
    #[arg(long)]
    check_interval: Option<u64>,

    /// Seconds without a new segment before restarting (overrides config)
    #[arg(long)]
    stale_threshold: Option<u64>,

    /// Seconds allowed for the first segment of a session (overrides config)
    #[arg(long)]
    startup_grace: Option<u64>,

    /// Skip the pre-flight stream probe
    #[arg(long)]
    skip_probe: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every check and poll)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Print the current status file and exit
    #[arg(long)]
    status: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut config::WatchdogConfig) {
        if let Some(source) = &self.source {
            config.stream.source_url = source.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.capture.output_dir = dir.clone();
        }
        if let Some(secs) = self.check_interval {
            config.watchdog.check_interval_secs = secs;
        }
        if let Some(secs) = self.stale_threshold {
            config.watchdog.stale_threshold_secs = secs;
        }
        if let Some(secs) = self.startup_grace {
            config.watchdog.startup_grace_secs = secs;
        }
        if self.skip_probe {
            config.probe.enabled = false;
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid config");
        std::process::exit(1);
    }

    if cli.status {
        print_status(&config);
        return;
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                println!("# config valid, not running");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                std::process::exit(1);
            }
        }
        return;
    }

    let output_dir = config.capture.output_dir.clone();
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        tracing::error!(path = %output_dir.display(), error = %e, "cannot create output directory");
        std::process::exit(1);
    }
    let _lock = match lock::InstanceLock::acquire(&output_dir) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "cannot take instance lock");
            std::process::exit(1);
        }
    };

    if config.probe.enabled {
        if let Err(e) = probe::probe_source(&config.probe, &config.stream.source_url).await {
            tracing::error!(error = %e, "stream source unreachable, not starting");
            std::process::exit(1);
        }
    }

    let mut signals = match signals::SignalHandler::install(config.stop_file_path()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "serve")]
    {
        if config.serve.enabled {
            let serve_config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve::run(&serve_config).await {
                    tracing::error!(error = %e, "status server failed");
                }
            });
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.stream.source_url,
        output_dir = %output_dir.display(),
        "segment-watchdog starting"
    );

    let mut supervisor = supervisor::Supervisor::new(config);
    if let Err(e) = supervisor.start().await {
        tracing::error!(error = %e, "failed to start supervisor");
        supervisor.stop().await;
        std::process::exit(1);
    }

    let trigger = signals.wait().await;
    tracing::info!(%trigger, "shutting down");
    supervisor.stop().await;
}

fn print_status(config: &config::WatchdogConfig) {
    let file = status::StatusFile::new(config.status_path());
    match file.read() {
        Ok(Some(data)) => match serde_json::to_string_pretty(&data) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render status");
                std::process::exit(1);
            }
        },
        Ok(None) => println!("not running (no status file at {})", file.path().display()),
        Err(e) => {
            tracing::error!(error = %e, "failed to read status file");
            std::process::exit(1);
        }
    }
}
