mod core;
mod log;

use std::fs;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::core::array::Array;
use crate::core::result::TileInput;

#[derive(Parser)]
#[command(name = "qpix-sim", about = "Discrete-event simulator for a mesh of front-end readout ASICs")]
struct Cli {
    #[arg(long, default_value_t = 4)]
    nrows: u32,
    #[arg(long, default_value_t = 4)]
    ncols: u32,
    #[arg(long, default_value_t = 30_000_000.0)]
    f_nominal: f64,
    #[arg(long, default_value_t = 0.05)]
    pct_spread: f64,
    #[arg(long, default_value_t = 15_000)]
    remote_timeout: u64,
    #[arg(long, default_value_t = 2)]
    seed: u64,
    #[arg(long, default_value = "left")]
    route: String,
    #[arg(long)]
    trunk_pos: Option<usize>,
    #[arg(long)]
    tile: Option<String>,
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interrogate on a fixed cadence for a fixed number of rounds.
    Interrogate {
        #[arg(long, default_value_t = 0.5)]
        interval: f64,
        #[arg(long, default_value_t = 1)]
        rounds: u32,
        #[arg(long)]
        hard: bool,
    },
    /// Just let the clock run, no interrogation packets.
    Idle {
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logger = log::Logger::new(&cli.log_level);

    info!(
        "building {}x{} array, f_nominal={}Hz, route={}",
        cli.nrows, cli.ncols, cli.f_nominal, cli.route
    );

    let mut array = Array::new(cli.nrows, cli.ncols, cli.f_nominal, cli.pct_spread, cli.remote_timeout, cli.seed);

    if let Err(e) = array.route(&cli.route, cli.remote_timeout, false, cli.trunk_pos) {
        error!("failed to apply route {:?}: {e}", cli.route);
        return ExitCode::FAILURE;
    }

    if let Some(path) = &cli.tile {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to read tile file {path}: {e}");
                return ExitCode::FAILURE;
            }
        };
        let tile: TileInput = match serde_json::from_str(&contents) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to parse tile file {path}: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = array.inject_tile(&tile) {
            error!("failed to inject tile {path}: {e}");
            return ExitCode::FAILURE;
        }
        info!("injected tile {path}");
    }

    match cli.command {
        Command::Interrogate { interval, rounds, hard } => {
            for round in 0..rounds {
                array.interrogate(interval, hard);
                info!("interrogation round {} complete, array clock at {:.6e}s", round + 1, array.array_clock());
            }
        }
        Command::Idle { interval } => {
            array.idle_for(interval);
        }
    }

    let result = array.result();
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("failed to serialize run result: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
