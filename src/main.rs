use ballwatch::{
    spawn_cadence, Database, EffectiveFilter, LifetimeTracker, NewMeasurement, RaiseOutcome,
    Readings, SystemClock, TickConfig, TickOutcome,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ballwatch")]
#[command(author, version, about = "Batch ledger and component lifetime tracking for a steel-ball line")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// SQLite database file
    #[arg(long, env = "BALLWATCH_DB", default_value = "ballwatch.db", global = true)]
    db: PathBuf,

    /// Length of one tick step in milliseconds
    #[arg(long, env = "TICK_INTERVAL_MS", default_value = "60000", global = true)]
    tick_interval_ms: i64,

    /// Wear hours credited per elapsed step (default: the step length in hours)
    #[arg(long, env = "TICK_DELTA_HOURS_PER_STEP", global = true)]
    hours_per_step: Option<f64>,

    /// Allow `components credit`
    #[arg(long, env = "ENABLE_MANUAL_TICK", global = true)]
    enable_manual_tick: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Raw measurements, corrections and the effective view
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Component lifetime counters
    Components {
        #[command(subcommand)]
        action: ComponentAction,
    },

    /// Alarm log
    Alarms {
        #[command(subcommand)]
        action: AlarmAction,
    },

    /// Run one tick cycle now
    Tick,

    /// Run the tick cycle on its cadence until interrupted
    Run,
}

#[derive(Subcommand, Debug)]
enum LedgerAction {
    /// Append a measurement given as JSON
    Append {
        /// e.g. '{"batch_code":"B1","date":"2025-09-30","time":"08:00:00","shift":2,"power_kw":12.5}'
        json: String,
    },

    /// Tombstone a measurement
    Delete {
        id: i32,
        #[arg(short, long)]
        actor: Option<String>,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Correct fields of a measurement; JSON holds only the fields to change
    Edit {
        id: i32,
        json: String,
        #[arg(short, long)]
        actor: Option<String>,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Print effective rows for a date
    Show {
        /// YYYY-MM-DD
        date: String,
        #[arg(short, long)]
        batch: Option<String>,
        #[arg(short, long)]
        shift: Option<i32>,
        /// Only rows up to the end of this hour (0-23)
        #[arg(long)]
        upto_hour: Option<i32>,
    },

    /// List batch codes with effective rows on a date
    Batches { date: String },

    /// Show the raw row, tombstone and overrides of a measurement
    History { id: i32 },
}

#[derive(Subcommand, Debug)]
enum ComponentAction {
    /// List counters
    List,

    /// Start tracking a component
    Add {
        name: String,
        #[arg(short, long, default_value = "0")]
        warning_hours: f64,
    },

    /// Set warning thresholds, e.g. `set-warning impeller1=500 impeller2=500`
    SetWarning {
        #[arg(required = true, value_parser = parse_threshold)]
        items: Vec<(String, f64)>,
    },

    /// Zero a component's hours
    Reset { name: String },

    /// Manually add hours to one component (needs --enable-manual-tick)
    Credit { name: String, hours: f64 },
}

#[derive(Subcommand, Debug)]
enum AlarmAction {
    /// Most recent alarms
    List {
        #[arg(short, long, default_value = "100")]
        limit: i64,
    },

    /// Alarms not yet acknowledged
    Open,

    /// Record an alarm unless the same type and location is already open
    Raise {
        #[arg(short = 't', long = "type")]
        alarm_type: String,
        #[arg(short, long, default_value = "")]
        location: String,
        #[arg(short, long)]
        details: Option<String>,
    },

    /// Close an open alarm
    Ack { id: i32 },
}

fn parse_threshold(s: &str) -> Result<(String, f64), String> {
    let (name, hours) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=HOURS, got '{}'", s))?;
    let hours = hours
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid hours in '{}': {}", s, e))?;
    Ok((name.trim().to_string(), hours))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing output: {}", e),
    }
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let db = match Database::open_at(&args.db) {
        Ok(db) => db,
        Err(e) => fail(format!("failed to open database {}: {}", args.db.display(), e)),
    };

    let mut config = TickConfig::default().with_step_interval_ms(args.tick_interval_ms);
    if let Some(hours) = args.hours_per_step {
        config = config.with_hours_per_step(hours);
    }

    match args.command {
        Command::Ledger { action } => handle_ledger_action(&db, action),
        Command::Components { action } => {
            let tracker = new_tracker(&db, config);
            handle_component_action(&tracker, action, args.enable_manual_tick)
        }
        Command::Alarms { action } => handle_alarm_action(&db, action),
        Command::Tick => {
            let tracker = new_tracker(&db, config);
            match tracker.advance(Utc::now()) {
                Ok(TickOutcome::Advanced(report)) => print_json(&report),
                Ok(TickOutcome::Busy) => println!("Tick cycle already running."),
                Err(e) => fail(e),
            }
        }
        Command::Run => {
            let tracker = Arc::new(new_tracker(&db, config));
            let period = Duration::from_millis(tracker.config().step_interval_ms as u64);
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            if let Err(e) = ctrlc::set_handler(move || {
                let _ = stop_tx.send(());
            }) {
                fail(format!("failed to install signal handler: {}", e));
            }

            eprintln!("Ticking every {} ms (Ctrl-C to stop)", period.as_millis());
            if let Err(e) = run_until_stopped(tracker, period, stop_rx) {
                fail(format!("failed to start cadence: {}", e));
            }
        }
    }
}

/// Drive the cadence until something is sent on `stop` (SIGINT/SIGTERM in `run`).
fn run_until_stopped(tracker: Arc<LifetimeTracker>, period: Duration, stop: Receiver<()>) -> std::io::Result<()> {
    let handle = spawn_cadence(tracker, Arc::new(SystemClock), period)?;
    let _ = stop.recv();
    tracing::info!("shutdown requested");
    handle.stop();
    Ok(())
}

fn new_tracker(db: &Database, config: TickConfig) -> LifetimeTracker {
    match LifetimeTracker::new(db.clone(), config) {
        Ok(tracker) => tracker,
        Err(e) => fail(e),
    }
}

fn handle_ledger_action(db: &Database, action: LedgerAction) {
    match action {
        LedgerAction::Append { json } => {
            let m: NewMeasurement = match serde_json::from_str(&json) {
                Ok(m) => m,
                Err(e) => fail(format!("invalid measurement JSON: {}", e)),
            };
            match db.append_raw(&m) {
                Ok(id) => println!("Appended measurement {} (batch {}, {} {})", id, m.batch_code, m.date, m.time),
                Err(e) => fail(e),
            }
        }

        LedgerAction::Delete { id, actor, reason } => {
            match db.soft_delete(id, actor.as_deref(), reason.as_deref(), Utc::now()) {
                Ok(()) => println!("Deleted measurement {}", id),
                Err(e) => fail(e),
            }
        }

        LedgerAction::Edit { id, json, actor, reason } => {
            let patch = match Readings::from_patch_json(&json) {
                Ok(p) => p,
                Err(e) => fail(e),
            };
            match db.apply_override(id, &patch, actor.as_deref(), reason.as_deref(), Utc::now()) {
                Ok(override_id) => println!("Recorded override {} for measurement {}", override_id, id),
                Err(e) => fail(e),
            }
        }

        LedgerAction::Show { date, batch, shift, upto_hour } => {
            let mut filter = EffectiveFilter::for_date(date);
            if let Some(b) = batch {
                filter = filter.with_batch(b);
            }
            if let Some(s) = shift {
                filter = filter.with_shift(s);
            }
            if let Some(h) = upto_hour {
                filter = filter.up_to_hour(h);
            }
            match db.query_effective(&filter) {
                Ok(rows) => print_json(&rows),
                Err(e) => fail(e),
            }
        }

        LedgerAction::Batches { date } => match db.effective_batch_codes(&date) {
            Ok(codes) if codes.is_empty() => println!("No batches on {}.", date),
            Ok(codes) => {
                for code in codes {
                    println!("{}", code);
                }
            }
            Err(e) => fail(e),
        },

        LedgerAction::History { id } => match db.history(id) {
            Ok(history) => print_json(&history),
            Err(e) => fail(e),
        },
    }
}

fn handle_component_action(tracker: &LifetimeTracker, action: ComponentAction, manual_tick: bool) {
    let db = tracker.database();
    match action {
        ComponentAction::List => match db.list_components() {
            Ok(components) if components.is_empty() => println!("No components tracked."),
            Ok(components) => {
                println!("{:<20} {:>12} {:>12}  {}", "COMPONENT", "HOURS", "WARNING", "LAST RESET");
                println!("{}", "-".repeat(70));
                for c in components {
                    println!(
                        "{:<20} {:>12.3} {:>12.1}  {}",
                        c.component_name,
                        c.accumulated_hours,
                        c.warning_hours,
                        c.last_reset_at.unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Err(e) => fail(e),
        },

        ComponentAction::Add { name, warning_hours } => match db.register_component(&name, warning_hours) {
            Ok(true) => println!("Tracking {} (warning at {} h)", name, warning_hours),
            Ok(false) => println!("{} is already tracked", name),
            Err(e) => fail(e),
        },

        ComponentAction::SetWarning { items } => match db.update_warning_thresholds(&items) {
            Ok(()) => println!("Updated {} warning threshold(s)", items.len()),
            Err(e) => fail(e),
        },

        ComponentAction::Reset { name } => match tracker.reset_component(&name, Utc::now()) {
            Ok(()) => println!("Reset {} to 0 hours", name),
            Err(e) => fail(e),
        },

        ComponentAction::Credit { name, hours } => {
            if !manual_tick {
                fail("manual tick is disabled (pass --enable-manual-tick or set ENABLE_MANUAL_TICK)");
            }
            match tracker.credit_hours(&name, hours, Utc::now()) {
                Ok(report) => print_json(&report),
                Err(e) => fail(e),
            }
        }
    }
}

fn handle_alarm_action(db: &Database, action: AlarmAction) {
    match action {
        AlarmAction::List { limit } => match db.list_alarms(limit) {
            Ok(alarms) => print_json(&alarms),
            Err(e) => fail(e),
        },

        AlarmAction::Open => match db.open_alarms() {
            Ok(alarms) => print_json(&alarms),
            Err(e) => fail(e),
        },

        AlarmAction::Raise { alarm_type, location, details } => {
            match db.raise(&alarm_type, &location, details.as_deref(), Utc::now()) {
                Ok(RaiseOutcome::Raised(id)) => println!("Raised alarm {}", id),
                Ok(RaiseOutcome::Suppressed) => println!("An alarm of this type is already open at '{}'", location),
                Err(e) => fail(e),
            }
        }

        AlarmAction::Ack { id } => match db.acknowledge(id, Utc::now()) {
            Ok(true) => println!("Acknowledged alarm {}", id),
            Ok(false) => println!("Alarm {} was already acknowledged", id),
            Err(e) => fail(e),
        },
    }
}
