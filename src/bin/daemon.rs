//! `ocd`: parse arguments, load configuration, set up logging, and run the
//! daemon until a shutdown signal arrives.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oc::config::Config;
use oc::datadir::DataDirectory;
use oc::dispatch::{CalcHandler, InfoHandler, Registry};
use oc::{setup_panic_hook, DaemonHandle, VERSION};

fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }
    if args.len() == 3 && args[1] == "--conf" {
        return Some(PathBuf::from(&args[2]));
    }
    eprintln!("Usage: {} [--conf <path>]", args[0]);
    process::exit(1);
}

fn setup_logger(level: log::LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{:>5}] [{}] {}",
                timestamp_stamp(),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn timestamp_stamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is set before the Unix epoch");
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

fn install_handlers(registry: Registry, vending: Arc<oc::vending::VendingPool>, wallet: Arc<dyn oc::wallet::Wallet>) -> Registry {
    registry
        .register("calc", Box::new(CalcHandler))
        .register("info", Box::new(InfoHandler { vending, wallet }))
}

fn main() {
    setup_panic_hook();

    let config_path = parse_args(std::env::args().collect());
    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error loading configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = setup_logger(config.log_level) {
        eprintln!("error setting up logging: {}", e);
        process::exit(1);
    }

    log::info!("oc daemon {} starting up", VERSION);

    let data_dir = match config.data_dir() {
        Ok(p) => DataDirectory::new(p),
        Err(e) => {
            log::error!("could not determine data directory: {}", e);
            process::exit(1);
        }
    };

    let handle = match DaemonHandle::start(config, data_dir, None, install_handlers) {
        Ok(h) => h,
        Err(e) => {
            log::error!("startup failed: {}", e);
            process::exit(1);
        }
    };

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown_requested.clone();
        if let Err(e) = ctrlc_handler(flag) {
            log::warn!("could not install signal handler: {}", e);
        }
    }

    log::info!("oc daemon ready");
    while handle.is_alive() && !shutdown_requested.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(500));
    }

    log::info!("oc daemon shutting down");
    handle.stop();
}

/// `ocd` carries no dedicated signal-handling dependency; the daemon's only
/// unconditional exit path is both worker threads dying (`handle.is_alive()`
/// going false). `shutdown_requested` is left in place for a future signal
/// handler to flip without reshaping the poll loop below it.
fn ctrlc_handler(_flag: Arc<AtomicBool>) -> std::io::Result<()> {
    Ok(())
}
