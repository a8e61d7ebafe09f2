//! `vmpulse run`: the long-lived collection loop.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::error;
use vmpulse_core::{Collector, CollectorConfig};

pub struct RunArgs {
    pub config_path: Option<String>,
    pub sink_url: Option<String>,
    pub database: Option<String>,
    pub token: Option<String>,
    pub interval_sec: Option<f64>,
    pub status_every_sec: u64,
}

pub fn run(args: RunArgs) {
    let mut config = match load_config(args.config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(url) = args.sink_url {
        config.sink_url = url;
    }
    if let Some(db) = args.database {
        config.sink_database = db;
    }
    if let Some(token) = args.token {
        config.sink_token = token;
    }
    if let Some(secs) = args.interval_sec {
        if !secs.is_finite() || secs <= 0.0 {
            eprintln!("Error: --interval must be positive");
            std::process::exit(1);
        }
        config.poll_interval = Duration::from_secs_f64(secs);
    }

    let collector = Collector::with_defaults(config);
    if let Err(e) = collector.start() {
        eprintln!("Error starting collector: {e}");
        std::process::exit(1);
    }

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    println!("Collecting (Ctrl+C to stop)");
    println!(
        "  Interval:  {:.1}s",
        collector.config().poll_interval.as_secs_f64()
    );
    println!(
        "  Sink:      {} (db {})",
        collector.config().sink_url,
        collector.config().sink_database
    );
    println!();

    let status_every = Duration::from_secs(args.status_every_sec);
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));
        if !status_every.is_zero() && last_status.elapsed() >= status_every {
            print_status(&collector);
            last_status = Instant::now();
        }
    }

    collector.stop();
    print_status(&collector);
}

fn load_config(path: Option<&str>) -> Result<CollectorConfig, String> {
    let Some(path) = path else {
        return Ok(CollectorConfig::default());
    };
    let raw = fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))
}

fn print_status(collector: &Collector) {
    match serde_json::to_string(&collector.status()) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("serializing status failed: {e}"),
    }
}
