use clap::Parser;
use gs_types::{Dataset, Stage};
use gs_worker::{default_results_dir, ResultLog, TrialState, TrialSummary};
use std::path::PathBuf;

/// Rank the trials of an experiment group by their dev-set objective.
#[derive(Parser, Debug)]
#[command(name = "sweep-results", version, about)]
struct Args {
    /// Experiment group passed to `sweep`
    group: String,

    /// Dataset the group was trained on (decides the objective metric)
    dataset: Dataset,

    #[arg(long, env = "GPUSWEEP_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Show only the best K trials
    #[arg(long)]
    top: Option<usize>,

    /// Print summaries as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn status(state: &TrialState) -> String {
    match state {
        TrialState::Running => "running".to_string(),
        TrialState::Completed => "completed".to_string(),
        TrialState::Failed { reason } => format!("failed: {reason}"),
    }
}

fn metric(summary: &TrialSummary, stage: Stage, name: &str) -> String {
    summary
        .last
        .get(&stage)
        .and_then(|m| m.get(name))
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "-".to_string())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let dir = args.results_dir.unwrap_or_else(default_results_dir);
    let log = ResultLog::load_group(&dir, &args.group)?;

    let mut summaries = log.summarize(args.dataset);
    if let Some(k) = args.top {
        summaries.truncate(k);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let objective = args.dataset.objective();
    println!(
        "{:<10} {:>12} {:>12} {:>12}  {}",
        "trial",
        format!("best {objective}"),
        format!("dev {objective}"),
        format!("test {objective}"),
        "status"
    );
    for summary in &summaries {
        let best = summary
            .best_objective
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:>12} {:>12} {:>12}  {}",
            summary.trial_id,
            best,
            metric(summary, Stage::Dev, objective),
            metric(summary, Stage::Test, objective),
            status(&summary.state)
        );
    }
    Ok(())
}
