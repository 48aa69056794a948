use anyhow::Context;
use clap::Parser;
use gs_queue::{default_spool_dir, SpoolBroker};
use gs_types::QueueName;
use gs_worker::{default_results_dir, JsonlSink, Worker, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run queued training jobs for one GPU.
#[derive(Parser, Debug)]
#[command(name = "sweep-worker", version, about)]
struct Args {
    /// Queue to consume, e.g. gpu1
    #[arg(long)]
    queue: QueueName,

    /// Spool directory shared with the dispatcher
    #[arg(long, env = "GPUSWEEP_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Directory receiving <group>.jsonl result logs
    #[arg(long, env = "GPUSWEEP_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Idle polling interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    poll_ms: u64,

    /// Kill jobs running longer than this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Run every pending task, then exit
    #[arg(long, default_value_t = false)]
    drain: bool,

    /// Requeue tasks left in running/ by a worker that died
    #[arg(long, default_value_t = false)]
    recover: bool,
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
    let spool_dir = args.spool_dir.unwrap_or_else(default_spool_dir);
    let results_dir = args.results_dir.unwrap_or_else(default_results_dir);

    let broker = SpoolBroker::create(&spool_dir)
        .await
        .with_context(|| format!("creating spool directory {}", spool_dir.display()))?;
    let sink = JsonlSink::new(&results_dir)?;

    let mut config = WorkerConfig::new(args.queue);
    config.poll_interval = Duration::from_millis(args.poll_ms);
    config.job_timeout = args.timeout_secs.map(Duration::from_secs);

    info!(
        queue = %config.queue,
        spool = %spool_dir.display(),
        results = %results_dir.display(),
        "starting worker"
    );
    let worker = Worker::bind(config, broker, sink).await?;
    if args.recover {
        worker.source().recover_running(worker.lease()).await?;
    }

    if args.drain {
        let ran = worker.run_until_idle().await?;
        info!(tasks = ran, "queue drained");
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current task");
            let _ = tx.send(true);
        }
    });
    worker.run(rx).await;
    Ok(())
}
