use std::path::PathBuf;

use clap::Parser;

use fanout::{config, daemon, telemetry};

#[derive(Parser)]
#[command(name = "fanout", about = "Persistent publish/subscribe message bus")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    let mut cfg = config::load_or_init(&cli.config);
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }

    telemetry::init(telemetry::TelemetryConfig::new(
        cli.verbose,
        cfg.logging.clone(),
    ));

    if let Err(e) = daemon::run(cfg) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}
