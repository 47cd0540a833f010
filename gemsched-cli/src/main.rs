//! Command-line interface for gemsched

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use gemsched::prelude::*;
use gemsched::SchedulerReport;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "gemsched")]
#[command(version = gemsched::VERSION)]
#[command(about = "GPU command submission simulator and control tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal)]
    verbosity: Verbosity,

    /// Device configuration file (JSON)
    #[arg(short, long, env = "GEMSCHED_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a simulated device with synthetic clients
    Simulate {
        /// Number of clients
        #[arg(long, default_value_t = 4)]
        clients: usize,

        /// Submissions per client
        #[arg(short, long, default_value_t = 100)]
        submissions: usize,

        /// Target engine
        #[arg(short, long, value_enum, default_value_t = Engine::Render)]
        engine: Engine,

        /// Control tokens applied before the run
        #[arg(long)]
        controls: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config {
        /// Start from the testing preset instead of the defaults
        #[arg(long)]
        testing: bool,
    },

    /// Apply control tokens to a fresh device and show the result
    Control {
        /// Tokens such as "sharedt=40 sharedc=30"
        tokens: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Minimal,
    Normal,
    Detailed,
    Debug,
}

impl Verbosity {
    fn level(self) -> log::LevelFilter {
        match self {
            Verbosity::Minimal => log::LevelFilter::Warn,
            Verbosity::Normal => log::LevelFilter::Info,
            Verbosity::Detailed => log::LevelFilter::Debug,
            Verbosity::Debug => log::LevelFilter::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Engine {
    Render,
    Video,
    Blit,
}

impl From<Engine> for EngineId {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Render => EngineId::Render,
            Engine::Video => EngineId::Video,
            Engine::Blit => EngineId::Blit,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn load_config(path: Option<&PathBuf>, testing: bool) -> anyhow::Result<DeviceConfig> {
    match path {
        Some(path) => DeviceConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None if testing => Ok(DeviceConfig::testing()),
        None => Ok(DeviceConfig::default()),
    }
}

fn print_report(report: &SchedulerReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(())
}

fn simulate(
    config: DeviceConfig,
    clients: usize,
    submissions: usize,
    engine: EngineId,
    controls: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (device, sim) = Device::simulated(config)?;
    if let Some(tokens) = controls {
        device.apply_control(tokens).context("applying controls")?;
    }

    let mut sessions = Vec::with_capacity(clients);
    for _ in 0..clients {
        let client = device.open_client(PriorityClass::Normal)?;
        let batch = device.create_object(client, 4096)?;
        sessions.push((client, batch));
    }

    let total = (clients * submissions) as u64;
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let started = Instant::now();
    for _ in 0..submissions {
        for &(client, batch) in &sessions {
            let args = SubmitArgs::new(engine, vec![ExecObject::new(batch)], 64);
            device
                .submit(client, &args)
                .with_context(|| format!("submitting for {}", client))?;
            pb.inc(1);
        }
    }
    device.retire_requests();
    pb.finish_with_message("done");

    log::info!(
        "{} batches executed in {:?}",
        sim.executed_batches().len(),
        started.elapsed()
    );
    print_report(&device.control_snapshot(), format)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbosity.level())
        .parse_default_env()
        .init();

    match &cli.command {
        Commands::Simulate {
            clients,
            submissions,
            engine,
            controls,
            format,
        } => {
            let config = load_config(cli.config.as_ref(), false)?;
            simulate(
                config,
                *clients,
                *submissions,
                (*engine).into(),
                controls.as_deref(),
                *format,
            )?;
        }

        Commands::Config { testing } => {
            let config = load_config(cli.config.as_ref(), *testing)?;
            println!("{}", config.to_json()?);
        }

        Commands::Control { tokens, format } => {
            let config = load_config(cli.config.as_ref(), false)?;
            let (device, _sim) = Device::simulated(config)?;
            device.apply_control(tokens)?;
            print_report(&device.control_snapshot(), *format)?;
        }

        Commands::Version => {
            println!("gemsched v{}", gemsched::version());
            println!("GPU command submission core");
        }
    }

    Ok(())
}
