use anyhow::Context;
use clap::{Parser, ValueEnum};
use gs_dispatch::{run_sweep, SweepConfig, DEFAULT_COUNT, DEFAULT_EPOCHS, DEFAULT_LOG_INTERVAL};
use gs_queue::{default_spool_dir, Dispatcher, SpoolBroker};
use gs_search::{
    CommandBuilder, ConfigSampler, ConstantDevice, DevicePolicy, RoundRobin, TrainerLayout,
    TrialIdPolicy,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TrialIds {
    /// Counter from a random base; unique within the sweep
    Sequential,
    /// Independent draws in [1, 1000000]
    Random,
}

/// Submit a random hyperparameter search to the GPU queues.
#[derive(Parser, Debug)]
#[command(name = "sweep", version, about)]
struct Args {
    /// Experiment group recorded with every trial
    group: String,

    /// Dataset to train on: trecqa, wikiqa, sick or msrp
    dataset: String,

    /// Number of trials to submit
    #[arg(long, default_value_t = DEFAULT_COUNT)]
    count: u32,

    #[arg(long, default_value_t = DEFAULT_EPOCHS)]
    epochs: u32,

    #[arg(long, default_value_t = DEFAULT_LOG_INTERVAL)]
    log_interval: u32,

    /// Spool directory shared with the workers
    #[arg(long, env = "GPUSWEEP_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Device every trial is sent to
    #[arg(long, default_value_t = 1)]
    device: u32,

    /// Devices to rotate through with --round-robin
    #[arg(long, value_delimiter = ',', requires = "round_robin")]
    devices: Vec<u32>,

    #[arg(long, default_value_t = false, requires = "devices")]
    round_robin: bool,

    #[arg(long, value_enum, default_value_t = TrialIds::Sequential)]
    trial_ids: TrialIds,

    /// Interpreter running the training script
    #[arg(long, env = "GPUSWEEP_PYTHON", default_value = "python")]
    python: String,

    #[arg(long, env = "GPUSWEEP_SCRIPT", default_value = "main.py")]
    script: PathBuf,

    #[arg(long, env = "GPUSWEEP_MODEL_DIR", default_value = "saved_models")]
    model_dir: PathBuf,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = SweepConfig::new(
        args.group,
        &args.dataset,
        args.count,
        args.epochs,
        args.log_interval,
    )?;

    let mut devices: Box<dyn DevicePolicy> = if args.round_robin {
        Box::new(RoundRobin::new(args.devices)?)
    } else {
        Box::new(ConstantDevice(args.device))
    };

    let mut base_rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let trial_ids = match args.trial_ids {
        TrialIds::Sequential => TrialIdPolicy::sequential_with_random_base(&mut base_rng),
        TrialIds::Random => TrialIdPolicy::Random,
    };
    let mut sampler = match args.seed {
        Some(seed) => ConfigSampler::seeded(seed, trial_ids),
        None => ConfigSampler::from_entropy(trial_ids),
    };

    let builder = CommandBuilder::new(TrainerLayout {
        interpreter: args.python,
        script: args.script,
        model_dir: args.model_dir,
        ..TrainerLayout::default()
    });

    let spool_dir = args.spool_dir.unwrap_or_else(default_spool_dir);
    info!(spool = %spool_dir.display(), "using spool broker");
    let dispatcher = Dispatcher::new(SpoolBroker::new(&spool_dir));

    let summary = run_sweep(&config, &mut sampler, devices.as_mut(), &builder, &dispatcher)
        .await
        .with_context(|| format!("sweep '{}' aborted", config.group))?;

    for submission in &summary.submitted {
        println!("{} trial={} gpu{}", submission.task_id, submission.trial_id, submission.device);
    }
    Ok(())
}
