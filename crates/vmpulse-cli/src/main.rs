//! CLI for vmpulse: poll VM telemetry into InfluxDB.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vmpulse")]
#[command(about = "vmpulse — QEMU/KVM telemetry collector")]
#[command(version = vmpulse_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector until Ctrl+C, shipping metrics to the sink
    Run {
        /// Path to a JSON configuration file
        #[arg(long)]
        config: Option<String>,

        /// Sink base URL
        #[arg(long)]
        sink_url: Option<String>,

        /// Sink database name
        #[arg(long)]
        database: Option<String>,

        /// Sink bearer token (empty = unauthenticated)
        #[arg(long)]
        token: Option<String>,

        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<f64>,

        /// Print a status line every N seconds (0 = never)
        #[arg(long, default_value = "10")]
        status_every: u64,
    },

    /// List live VMs and their device topology, then exit
    Scan {
        /// Print the VM list as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            sink_url,
            database,
            token,
            interval,
            status_every,
        } => commands::run::run(commands::run::RunArgs {
            config_path: config,
            sink_url,
            database,
            token,
            interval_sec: interval,
            status_every_sec: status_every,
        }),
        Commands::Scan { json } => commands::scan::run(json),
    }
}
