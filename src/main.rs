//! # plcwatch
//!
//! Monitors an S7 PLC and queries the local history.
//!
//! # Usage
//!
//! ```bash
//! # Monitor the configured PLC until Ctrl-C
//! plcwatch run --config plcwatch.toml
//!
//! # Run against the in-process simulated PLC
//! plcwatch run --simulate -v
//!
//! # Alarm log for March, as JSON
//! plcwatch alarms --from 2024-03-01 --to 2024-03-31 --json
//!
//! # Production of one month
//! plcwatch production --year 2024 --month 3
//!
//! # Tool changes of one bank
//! plcwatch tools --bank machine_a
//!
//! # Print the effective configuration
//! plcwatch config
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

use plcwatch::alarm::{AlarmQuery, AlarmStore};
use plcwatch::config::AppConfig;
use plcwatch::event::{self, Event, DEFAULT_EVENT_CAPACITY};
use plcwatch::monitor::Monitor;
use plcwatch::production::ProductionStore;
use plcwatch::storage::Storage;
use plcwatch::tool_life::ToolHistoryStore;
use plcwatch::{logging, S7Client, SimulatedPlc};

/// Configuration file used when `--config` is not given and it exists.
const DEFAULT_CONFIG_FILE: &str = "plcwatch.toml";

/// Memory size of the simulated data block.
const SIMULATED_MEMORY: usize = 2048;

/// How long the main loop waits for an event before checking the stop flag.
const EVENT_WAIT: Duration = Duration::from_millis(200);

/// plcwatch - S7 PLC monitor with tool-life, tray, production and alarm tracking
#[derive(Parser, Debug)]
#[command(name = "plcwatch")]
#[command(version)]
#[command(about = "Polls an S7 PLC and tracks tool life, trays, production and alarms")]
#[command(long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs and results in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Monitor the PLC until Ctrl-C
    Run {
        /// Poll the in-process simulated PLC instead of the configured one
        #[arg(short = 's', long)]
        simulate: bool,
    },
    /// Query the alarm log
    Alarms {
        /// First start date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last start date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Alarm name
        #[arg(long)]
        name: Option<String>,
    },
    /// Query the daily production history
    Production {
        /// Year
        #[arg(long)]
        year: Option<i32>,
        /// Month (1-12)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
        month: Option<u32>,
        /// Day of month (1-31)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=31))]
        day: Option<u32>,
    },
    /// Query the tool change history
    Tools {
        /// Bank name
        #[arg(long)]
        bank: Option<String>,
        /// Tool id (T0..)
        #[arg(long)]
        tool: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() {
    if let Err(e) = run() {
        error!("plcwatch failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    logging::init(&config.logging, args.verbose, args.json);

    match args.command {
        Cmd::Run { simulate } => run_monitor(config, simulate, args.json),
        Cmd::Alarms { from, to, name } => {
            let store = AlarmStore::new(Storage::open(&config.storage.path)?);
            let rows = store.query(&AlarmQuery { from, to, name })?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    let end = row
                        .end_time
                        .map_or_else(|| "active".to_string(), |t| t.to_string());
                    println!(
                        "{:<6} {:<12} code={:<4} {} -> {}",
                        row.id, row.name, row.code, row.start_time, end
                    );
                }
            }
            Ok(())
        }
        Cmd::Production { year, month, day } => {
            let store = ProductionStore::new(Storage::open(&config.storage.path)?);
            let rows = store.query(year, month, day)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    println!("{}  {}", row.date, row.count);
                }
                println!("total  {}", rows.iter().map(|r| r.count).sum::<u64>());
            }
            Ok(())
        }
        Cmd::Tools { bank, tool } => {
            let store = ToolHistoryStore::new(Storage::open(&config.storage.path)?);
            let rows = store.query(bank.as_deref(), tool.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!(
                        "{:<10} {:<4} {} -> {} life={:<6} reason={} operator={}",
                        row.bank,
                        row.tool_id,
                        row.start_time,
                        row.end_time,
                        row.new_life_setting,
                        row.change_reason,
                        row.operator
                    );
                }
            }
            Ok(())
        }
        Cmd::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(AppConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Ok(AppConfig::load(DEFAULT_CONFIG_FILE)?),
        None => Ok(AppConfig::default()),
    }
}

fn run_monitor(
    config: AppConfig,
    simulate: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("plcwatch v{} starting...", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let (events, rx) = event::channel(DEFAULT_EVENT_CAPACITY);
    let (monitor, mut simulation) = if simulate {
        info!("Simulation mode enabled");
        let plc = SimulatedPlc::new(SIMULATED_MEMORY);
        let monitor = Monitor::new(config, plc.clone(), events)?;
        let simulation = Simulation::new(plc, &monitor);
        (monitor, Some(simulation))
    } else {
        let client = S7Client::new(config.plc.client_config());
        (Monitor::new(config, client, events)?, None)
    };

    let handle = monitor.start()?;
    while running.load(Ordering::SeqCst) && handle.is_running() {
        match rx.recv_timeout(EVENT_WAIT) {
            Ok(event) => report(&event, json),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Some(simulation) = simulation.as_mut() {
            simulation.step();
        }
    }

    handle.stop();
    let result = handle.join();
    for event in rx.try_iter() {
        report(&event, json);
    }
    let stats = result?;
    info!(
        cycles = stats.cycles,
        failed = stats.failed_cycles,
        "plcwatch shutdown complete"
    );
    Ok(())
}

fn report(event: &Event, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "failed to encode event"),
        }
    } else {
        debug!(?event, "event");
    }
}

/// Drives the simulated PLC so every counter has something to count.
struct Simulation {
    plc: SimulatedPlc,
    last_step: Instant,
    step: u64,
}

impl Simulation {
    const PERIOD: Duration = Duration::from_millis(500);

    fn new(plc: SimulatedPlc, monitor: &Monitor) -> Self {
        for bank in monitor.tool_banks() {
            if let Err(e) = bank.lock().set_life_limit("T0", 20) {
                warn!(error = %e, "failed to enable simulated tool");
            }
        }
        let trays = &monitor.config().trays.trays;
        if let Some(tray) = trays.first() {
            if let Err(e) = monitor.trays().lock().set_max_count(&tray.id, 10) {
                warn!(error = %e, "failed to enable simulated tray");
            }
        }
        Self {
            plc,
            last_step: Instant::now(),
            step: 0,
        }
    }

    fn step(&mut self) {
        if self.last_step.elapsed() < Self::PERIOD {
            return;
        }
        self.last_step = Instant::now();
        self.step += 1;

        let high = self.step % 2 == 1;
        self.plc.set_bit(600, 0, high);
        self.plc.set_bit(800, 0, high);
        self.plc.set_bit(750, 0, high);

        // emergency stop for a few seconds every minute
        let estop = self.step % 120 < 6;
        self.plc.poke(1011, u8::from(estop));
        self.plc.write_float(1200, (self.step as f32 * 0.5) % 360.0);
    }
}
