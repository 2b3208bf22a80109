mod config;
mod provider;
mod radio;
mod replay;
mod sim;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use config::Config;
use provider::{ChannelTarget, DataProvider};

#[derive(Parser, Debug)]
#[command(name = "rfind-provider")]
#[command(about = "Streams calibrated spectral integrations to a real-time consumer")]
struct Cli {
    #[command(subcommand)]
    backend: Backend,

    /// JSON configuration file
    #[arg(short = 'c', long, default_value = "rfind.json")]
    config: PathBuf,

    /// Directory holding the calibration references
    #[arg(long)]
    cal_dir: Option<PathBuf>,

    /// Log frames instead of publishing them
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Backend {
    /// Live USRP front-end
    Radio,
    /// Replay fragments from object storage
    Replay {
        /// Root directory of the object store
        #[arg(long)]
        store_root: Option<PathBuf>,

        /// Replay from this ISO-8601 time instead of tailing live data
        #[arg(long)]
        start: Option<String>,
    },
    /// Synthetic spectra
    Sim {
        /// RNG seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn build_provider(cli: &Cli, config: &mut Config) -> Result<Box<dyn DataProvider>, String> {
    if let Some(dir) = &cli.cal_dir {
        config.calibration.dir = dir.clone();
    }
    let target = ChannelTarget::from_config(&config.channel, cli.dry_run);

    let provider: Box<dyn DataProvider> = match &cli.backend {
        Backend::Radio => {
            let opener = radio::usrp_opener(config);
            Box::new(radio::RadioProvider::new(config, opener, target))
        }
        Backend::Replay { store_root, start } => {
            if let Some(root) = store_root {
                config.store.root = root.clone();
            }
            if let Some(start) = start {
                config.store.start = Some(start.clone());
            }
            log::info!(
                "replaying {}/{} with calibration in {}",
                config.store.root.display(),
                config.store.key_prefix,
                config.calibration.dir.display()
            );
            let store = Arc::new(rf_sdr::store::DirStore::new(&config.store.root));
            let settings = replay::ReplaySettings::from_config(config)?;
            Box::new(replay::ReplayProvider::new(store, settings, target)?)
        }
        Backend::Sim { seed } => Box::new(sim::SimProvider::new(config, *seed, target)),
    };
    Ok(provider)
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        log::error!("invalid configuration: {}", e);
        std::process::exit(1);
    }
    log::info!(
        "rfind-provider starting: {} bins, {:.3} s integrations, channel {}{}",
        config.n_bins,
        config.integration_secs,
        config.channel.endpoint(),
        if cli.dry_run { " (dry run)" } else { "" }
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            log::warn!("failed to install Ctrl-C handler: {}", e);
        }
    }

    let mut provider = match build_provider(&cli, &mut config) {
        Ok(provider) => provider,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = provider.connect() {
        log::error!("{} provider failed to connect: {}", provider.name(), e);
        std::process::exit(1);
    }
    if let Err(e) = provider.run(&running) {
        log::error!("{} provider stopped: {}", provider.name(), e);
        std::process::exit(1);
    }
    log::info!("shutdown complete");
}
