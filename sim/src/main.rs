//! SMOOTHING SIM: experiments with online smoothing in a bootstrap particle filter.
//!
//! This program can operate in two modes: compare and genealogy.
//!
//! - Compare mode: simulates a discretely observed Cox process, then runs independent replications of the
//!   exact O(N^2) smoother and of the naive O(N) smoother. The naive smoother's particle count is either given
//!   or calibrated so that both smoothers use about the same CPU time. Per-run estimates and per-step
//!   inter-quartile ranges are written as CSV.
//!
//! - Genealogy mode: runs the filter once with the full particle history kept, writes the trajectory of every
//!   final particle as CSV and logs how quickly the lineages coalesce.
//!
//! Parameters come from command-line flags, from an experiment configuration file (TOML/JSON/YAML), or both;
//! flags override the file.

mod common;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use common::{init_logger, method_file, prepare_output_dir};
use smoothing::sim::{
    ReplicationRecord, estimate_matrix, iqr_by_step, mean_cpu_time, run_replications, summarize,
    write_estimates_csv, write_summaries_csv, write_trajectories_csv,
};
use smoothing::{
    DiscreteCox, ParticleResamplingStrategy, SmcConfig, SmoothingStrategy, run,
};

const LONG_ABOUT: &str =
    "SMOOTHING SIM: experiments with online smoothing in a bootstrap particle filter.

This program can operate in two modes: compare and genealogy.

- Compare mode: runs independent replications of the exact O(N^2) and the naive O(N) online
  smoothers on a simulated Cox process dataset, optionally giving the naive smoother as many
  particles as fit in the exact smoother's CPU budget. Writes per-run estimates and per-step
  inter-quartile ranges as CSV.

- Genealogy mode: runs the filter once with the particle history kept and writes the trajectory
  of every final particle as CSV.

You can run experiments either by:
  1. Loading all parameters from a configuration file (TOML/JSON/YAML)
  2. Specifying parameters via command-line flags (which override the file)";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Experiments with online smoothing in a bootstrap particle filter.", long_about = LONG_ABOUT)]
struct Cli {
    /// Experiment configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command to execute (runs `compare` if only --config is given)
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "compare",
        about = "Compare the exact and naive online smoothers",
        long_about = "Simulate a Cox process dataset and run independent replications of the exact O(N^2) smoother and of the naive O(N) smoother. Unless --naive-particles is given, the naive smoother's particle count is calibrated from a pilot run so that its mean CPU time matches the exact smoother's."
    )]
    Compare(CompareArgs),
    #[command(
        name = "genealogy",
        about = "Record and export the particle genealogy of one run"
    )]
    Genealogy(GenealogyArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

/// Settings shared by every experiment.
#[derive(Args, Clone, Debug, Default)]
struct CommonArgs {
    /// Number of time steps
    #[arg(long)]
    horizon: Option<usize>,

    /// Seed of the simulated dataset
    #[arg(long)]
    data_seed: Option<u64>,

    /// Base seed of the particle filter runs
    #[arg(long)]
    seed: Option<u64>,

    /// Resampling scheme
    #[arg(long, value_enum)]
    scheme: Option<ParticleResamplingStrategy>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug, Default)]
struct CompareArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of independent replications per smoother
    #[arg(long)]
    runs: Option<usize>,

    /// Particles for the exact smoother
    #[arg(long)]
    exact_particles: Option<usize>,

    /// Particles for the naive smoother (calibrated when omitted)
    #[arg(long)]
    naive_particles: Option<usize>,

    /// Particles of the naive pilot run used for calibration
    #[arg(long)]
    pilot_particles: Option<usize>,

    /// Run replications in parallel (distorts CPU-time calibration)
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Clone, Debug, Default)]
struct GenealogyArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Where to write the template (.toml, .json, .yaml or .yml)
    #[arg(short, long, default_value = "experiment.toml")]
    output: PathBuf,
}

/// Logging settings of an experiment file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Everything an experiment needs, as stored in a configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ExperimentConfig {
    horizon: usize,
    data_seed: u64,
    seed: u64,
    runs: usize,
    exact_particles: usize,
    naive_particles: Option<usize>,
    pilot_particles: usize,
    genealogy_particles: usize,
    resampling_scheme: ParticleResamplingStrategy,
    resample_threshold: f64,
    parallel: bool,
    output: String,
    model: DiscreteCox,
    logging: LoggingConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            horizon: 100,
            data_seed: 1,
            seed: 42,
            runs: 100,
            exact_particles: 100,
            naive_particles: None,
            pilot_particles: 1000,
            genealogy_particles: 50,
            resampling_scheme: ParticleResamplingStrategy::Systematic,
            resample_threshold: 1.0,
            parallel: false,
            output: "output".to_string(),
            model: DiscreteCox::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExperimentConfig {
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let mut s = String::new();
        File::open(p)
            .with_context(|| format!("cannot open configuration {}", p.display()))?
            .read_to_string(&mut s)?;
        let config: ExperimentConfig = match extension(p).as_deref() {
            Some("json") => serde_json::from_str(&s)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&s)?,
            Some("toml") => toml::from_str(&s)?,
            _ => bail!("unsupported configuration file extension: {}", p.display()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that cannot be expressed in the file format itself.
    fn validate(&self) -> Result<()> {
        let DiscreteCox { mu, phi, sigma } = self.model;
        DiscreteCox::new(mu, phi, sigma).context("invalid model parameters")?;
        Ok(())
    }

    fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        let s = match extension(p).as_deref() {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string(self)?,
            _ => bail!("unsupported configuration file extension: {}", p.display()),
        };
        File::create(p)?.write_all(s.as_bytes())?;
        Ok(())
    }

    fn apply_common(&mut self, args: &CommonArgs) {
        if let Some(horizon) = args.horizon {
            self.horizon = horizon;
        }
        if let Some(data_seed) = args.data_seed {
            self.data_seed = data_seed;
        }
        if let Some(seed) = args.seed {
            self.seed = seed;
        }
        if let Some(scheme) = args.scheme {
            self.resampling_scheme = scheme;
        }
        if let Some(output) = &args.output {
            self.output = output.display().to_string();
        }
    }

    fn apply_compare(&mut self, args: &CompareArgs) {
        self.apply_common(&args.common);
        if let Some(runs) = args.runs {
            self.runs = runs;
        }
        if let Some(n) = args.exact_particles {
            self.exact_particles = n;
        }
        if args.naive_particles.is_some() {
            self.naive_particles = args.naive_particles;
        }
        if let Some(n) = args.pilot_particles {
            self.pilot_particles = n;
        }
        self.parallel |= args.parallel;
    }

    fn apply_genealogy(&mut self, args: &GenealogyArgs) {
        self.apply_common(&args.common);
        if let Some(n) = args.particles {
            self.genealogy_particles = n;
        }
    }

    /// Filter configuration for `num_particles` particles and `strategy`.
    fn smc_config(&self, num_particles: usize, strategy: SmoothingStrategy) -> SmcConfig {
        SmcConfig {
            num_particles,
            horizon: self.horizon,
            resample_threshold: self.resample_threshold,
            resampling_scheme: self.resampling_scheme,
            smoothing_strategy: strategy,
            seed: self.seed,
            store_history: false,
            parallel: false,
        }
    }

    /// Latent log-intensities and observed counts.
    fn simulate_data(&self) -> Result<(Vec<f64>, Vec<u64>)> {
        let mut rng = StdRng::seed_from_u64(self.data_seed);
        Ok(self.model.simulate(self.horizon, &mut rng)?)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Particle count that gives a smoother the CPU budget `cpu_target`, given
/// that `pilot_particles` particles took `cpu_pilot` seconds. Cost is taken
/// to be linear in the number of particles.
fn calibrate_particles(pilot_particles: usize, cpu_target: f64, cpu_pilot: f64) -> usize {
    if !(cpu_pilot > 0.0) || !cpu_target.is_finite() {
        return pilot_particles;
    }
    ((pilot_particles as f64 * cpu_target / cpu_pilot).floor() as usize).max(1)
}

#[derive(Serialize)]
struct IqrRow {
    step: usize,
    exact: f64,
    naive: f64,
}

fn write_iqr_csv(path: &Path, exact: &[ReplicationRecord], naive: &[ReplicationRecord]) -> Result<()> {
    let exact_iqr = iqr_by_step(&estimate_matrix(exact));
    let naive_iqr = iqr_by_step(&estimate_matrix(naive));
    let mut writer = csv::Writer::from_path(path)?;
    for (step, (e, n)) in exact_iqr.iter().zip(&naive_iqr).enumerate() {
        writer.serialize(IqrRow {
            step,
            exact: *e,
            naive: *n,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct DataRow {
    step: usize,
    state: f64,
    count: u64,
}

fn write_data_csv(path: &Path, states: &[f64], counts: &[u64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for (step, (state, count)) in states.iter().zip(counts).enumerate() {
        writer.serialize(DataRow {
            step,
            state: *state,
            count: *count,
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn run_compare(config: &ExperimentConfig) -> Result<()> {
    let output = prepare_output_dir(Path::new(&config.output))?;
    let (states, data) = config.simulate_data()?;
    info!(
        "Simulated {} Cox process observations ({}), data seed {}",
        data.len(),
        config.model,
        config.data_seed
    );
    let data_path = output.join("data.csv");
    write_data_csv(&data_path, &states, &data)?;
    info!("Simulated data written to {}", data_path.display());

    let exact_config = config.smc_config(config.exact_particles, SmoothingStrategy::Exact);
    info!(
        "Running {} replications of the exact smoother with N={}",
        config.runs, config.exact_particles
    );
    let exact = run_replications(&exact_config, &config.model, &data, config.runs, config.parallel)?;
    let cpu_exact = mean_cpu_time(&exact);

    let naive_particles = match config.naive_particles {
        Some(n) => n,
        None => {
            let pilot_config = config.smc_config(config.pilot_particles, SmoothingStrategy::Naive);
            let pilot_runs = config.runs.clamp(1, 5);
            let pilot = run_replications(&pilot_config, &config.model, &data, pilot_runs, false)?;
            let cpu_pilot = mean_cpu_time(&pilot);
            let n = calibrate_particles(config.pilot_particles, cpu_exact, cpu_pilot);
            info!(
                "Calibrated naive smoother: pilot N={} took {:.4}s, exact took {:.4}s, using N={}",
                config.pilot_particles, cpu_pilot, cpu_exact, n
            );
            n
        }
    };

    let naive_config = config.smc_config(naive_particles, SmoothingStrategy::Naive);
    info!(
        "Running {} replications of the naive smoother with N={}",
        config.runs, naive_particles
    );
    let naive = run_replications(&naive_config, &config.model, &data, config.runs, config.parallel)?;
    let cpu_naive = mean_cpu_time(&naive);
    info!("Mean CPU time: exact {cpu_exact:.4}s, naive {cpu_naive:.4}s");
    if config.parallel {
        warn!("Replications ran in parallel; CPU times include contention");
    }

    for (method, records) in [("exact", &exact), ("naive", &naive)] {
        let estimates_path = method_file(&output, "estimates", method);
        write_estimates_csv(records, &estimates_path)?;
        write_summaries_csv(&summarize(records), method_file(&output, "summary", method))?;
        info!("Estimates written to {}", estimates_path.display());
    }
    let iqr_path = output.join("iqr.csv");
    write_iqr_csv(&iqr_path, &exact, &naive)?;
    info!("Inter-quartile ranges written to {}", iqr_path.display());
    Ok(())
}

fn run_genealogy(config: &ExperimentConfig) -> Result<()> {
    let output = prepare_output_dir(Path::new(&config.output))?;
    let (_, data) = config.simulate_data()?;
    let smc_config = SmcConfig {
        store_history: true,
        ..config.smc_config(config.genealogy_particles, SmoothingStrategy::Naive)
    };
    let result = run(&smc_config, &config.model, &data)?;
    let Some(genealogy) = result.genealogy else {
        bail!("the run did not keep its genealogy");
    };

    let last = genealogy.last_step();
    for step in [0, last / 4, last / 2, 3 * last / 4, last] {
        info!(
            "Particles at step {} descend from {} distinct particles at step {}",
            last,
            genealogy.distinct_ancestors(last, step)?,
            step
        );
    }
    match genealogy.coalescence_step(last)? {
        Some(step) => info!("Lineages coalesce at step {step}"),
        None => info!("Lineages have not coalesced by step 0"),
    }

    let path = output.join("genealogy.csv");
    write_trajectories_csv(&genealogy, &path)?;
    info!("Trajectories written to {}", path.display());
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs) -> Result<()> {
    ExperimentConfig::default().to_file(&args.output)?;
    info!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => ExperimentConfig::default(),
    };

    // The file's logging settings apply unless overridden on the command line
    let log_level = if cli.config.is_some() && cli.log_level == "info" {
        config.logging.level.clone()
    } else {
        cli.log_level.clone()
    };
    let config_log_file = config.logging.file.as_ref().map(PathBuf::from);
    init_logger(&log_level, cli.log_file.as_ref().or(config_log_file.as_ref()))?;
    if let Some(path) = &cli.config {
        info!("Configuration loaded from {}", path.display());
    }

    let outcome = match cli.command {
        Some(Command::Compare(args)) => {
            config.apply_compare(&args);
            run_compare(&config)
        }
        Some(Command::Genealogy(args)) => {
            config.apply_genealogy(&args);
            run_genealogy(&config)
        }
        Some(Command::CreateConfig(args)) => create_config_file(&args),
        None if cli.config.is_some() => run_compare(&config),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    };
    if let Err(e) = &outcome {
        error!("{e:#}");
    }
    outcome
}
