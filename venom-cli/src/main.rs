//! venomq - operator tool for VenomQueue segments
//!
//! Structure:
//!   - main.rs: argument parsing and commands
//!   - builtins.rs: functions `serve` can run

mod builtins;

use anyhow::{bail, Context};
use builtins::Builtin;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use venom_queue::{
    Client, Direction, Entry, PollConfig, Poller, QueueError, RelayConfig, Segment, SegmentConfig,
    Worker,
};

#[derive(Parser)]
#[command(name = "venomq")]
#[command(about = "VenomQueue segment tool", long_about = None)]
struct Cli {
    /// TOML config providing segment name, geometry and poll budget
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Segment name; overrides the config file
    #[arg(short, long, global = true)]
    segment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a segment; it persists until `teardown`
    Create {
        /// Entries per queue
        #[arg(long)]
        capacity: Option<usize>,

        /// Largest payload in bytes
        #[arg(long)]
        max_payload: Option<usize>,
    },

    /// Show queue sizes, lock state and entries
    Inspect {
        /// Also print every entry
        #[arg(short, long)]
        entries: bool,
    },

    /// Empty both queues
    Clear,

    /// Unlink the segment
    Teardown,

    /// Call a function and print its result
    Call {
        function: String,

        /// JSON object of arguments
        #[arg(default_value = "{}")]
        args: String,

        /// Wall-clock budget in milliseconds; overrides the config
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run a built-in worker
    Serve {
        #[arg(value_enum)]
        function: Builtin,

        /// Keep serving after the idle budget runs out
        #[arg(long)]
        forever: bool,
    },

    /// Drop answered requests and release claims held by dead workers
    Reconcile,
}

/// Config file merged with command line overrides
struct Settings {
    segment: String,
    queue: SegmentConfig,
    poll: PollConfig,
    log_level: String,
}

impl Settings {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => Some(RelayConfig::load(path).with_context(|| format!("loading {}", path.display()))?),
            None => None,
        };

        let segment = match (&cli.segment, &file) {
            (Some(name), _) => name.clone(),
            (None, Some(config)) => config.segment.clone(),
            (None, None) => bail!("no segment given; pass --segment or --config"),
        };

        Ok(match file {
            Some(config) => Self {
                segment,
                queue: config.queue,
                poll: config.poll,
                log_level: config.log_level,
            },
            None => Self {
                segment,
                queue: SegmentConfig::default(),
                poll: PollConfig::default(),
                log_level: "info".into(),
            },
        })
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::resolve(&cli)?;
    init_tracing(&settings.log_level);
    tracing::debug!(
        segment = %settings.segment,
        config = ?cli.config,
        capacity = settings.queue.capacity,
        "settings resolved"
    );

    match cli.command {
        Commands::Create { capacity, max_payload } => {
            let mut config = settings.queue.clone();
            if let Some(capacity) = capacity {
                config.capacity = capacity;
            }
            if let Some(max_payload) = max_payload {
                config.max_payload = max_payload;
            }
            let segment = Segment::create(&settings.segment, &config)?;
            println!(
                "{} {} ({} entries x {} bytes per queue)",
                style("✓ created").green(),
                style(segment.descriptor()).cyan(),
                segment.capacity(),
                segment.max_payload()
            );
        }
        Commands::Inspect { entries } => {
            let segment = Segment::attach(&settings.segment)?;
            print_stats(&segment, entries);
        }
        Commands::Clear => {
            Segment::attach(&settings.segment)?.clear();
            println!("{} {}", style("✓ cleared").green(), settings.segment);
        }
        Commands::Teardown => {
            Segment::attach(&settings.segment)?.teardown()?;
            println!("{} {}", style("✓ removed").green(), settings.segment);
        }
        Commands::Call { function, args, timeout_ms } => {
            let args: serde_json::Value = serde_json::from_str(&args).context("args must be JSON")?;
            let segment = Segment::attach(&settings.segment)?;
            let poller = match timeout_ms {
                Some(ms) => Poller::deadline(Duration::from_millis(settings.poll.interval_ms), Duration::from_millis(ms)),
                None => settings.poll.poller(),
            };

            let client = Client::new(&segment).with_poller(poller);
            let mut pending = client.submit(&function, args)?;
            match pending.wait(&segment, client.poller()) {
                Ok(result) => println!("{result}"),
                Err(e @ QueueError::Timeout { .. }) => {
                    let withdrawn = pending.withdraw(&segment)?;
                    tracing::warn!(id = pending.id(), withdrawn, "call timed out");
                    eprintln!(
                        "{} {} ({})",
                        style("timeout:").yellow().bold(),
                        e,
                        if withdrawn { "request withdrawn" } else { "request still in flight" }
                    );
                    return Ok(ExitCode::from(2));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Serve { function, forever } => {
            let segment = Segment::attach(&settings.segment)?;
            let poller = settings.poll.poller();
            let mut worker = Worker::new(&segment, function.name(), function.handler());
            tracing::info!(function = function.name(), forever, "serving built-in worker");
            loop {
                let stats = worker.serve(&poller)?;
                if !forever {
                    println!(
                        "{} processed={} rejected={} dead_lettered={}",
                        style(format!("✓ {} idle", function.name())).green(),
                        stats.processed,
                        stats.rejected,
                        stats.dead_lettered
                    );
                    break;
                }
            }
        }
        Commands::Reconcile => {
            let report = Segment::attach(&settings.segment)?.reconcile();
            if report.is_clean() {
                println!("{}", style("✓ nothing to repair").green());
            }
            for key in &report.completed_inputs {
                println!("   {} answered request {}", style("-").yellow(), key);
            }
            for key in &report.released_claims {
                println!("   {} released claim {}", style("↺").yellow(), key);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ═══════════════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════════════

fn print_stats(segment: &Segment, with_entries: bool) {
    let stats = segment.stats();

    println!("{}", style("═══════════════════════════════════════════").cyan());
    println!("{}", style(format!("📋 {}", stats.descriptor)).cyan().bold());
    println!("{}", style("═══════════════════════════════════════════").cyan());
    println!("   Creator pid:  {}", stats.creator_pid);
    println!("   Capacity:     {}", stats.capacity);
    println!("   Max payload:  {}", format_size(stats.max_payload));
    println!("   Input:        {}", style(format!("{}/{}", stats.input_len, stats.capacity)).green());
    println!("   Output:       {}", style(format!("{}/{}", stats.output_len, stats.capacity)).green());
    println!("   Clears:       {}", stats.clears);
    println!("   Recoveries:   {}", stats.lock_recoveries);
    match stats.lock_holder {
        Some(holder) => println!(
            "   Lock:         {}",
            style(format!("held by {} for {:?}", holder.pid, holder.held_for)).yellow()
        ),
        None => println!("   Lock:         free"),
    }

    if with_entries {
        for direction in [Direction::Input, Direction::Output] {
            println!();
            println!("{}", style(format!("{direction}:")).bold());
            for entry in segment.queue(direction).scan() {
                print_entry(&entry);
            }
        }
    }
}

fn print_entry(entry: &Entry) {
    let payload = entry
        .payload_str()
        .map(str::to_string)
        .unwrap_or_else(|_| format!("<{} bytes>", entry.payload.len()));
    println!(
        "   #{:<6} {:<38} {:<10} {}",
        entry.sequence,
        entry.key,
        entry.state.as_str(),
        payload
    );
}

fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 { format!("{} MB", bytes / (1024 * 1024)) }
    else if bytes >= 1024 { format!("{} KB", bytes / 1024) }
    else { format!("{} bytes", bytes) }
}
