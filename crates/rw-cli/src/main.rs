//! Rungwise CLI
//!
//! # Commands
//!
//! - `rungwise run --space space.json -- <command> [args...]` - Run or resume a study
//! - `rungwise best --output-dir <dir>` - Print the best trial recorded in a study directory
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).
//! Exit status is 2 for configuration errors and missing resources, 1 for
//! anything else that stops a command.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rw_ledger::{JsonLedger, MetricsLedger};
use rw_optimizer::{
    CancelFlag, DeviceKind, ProcessTrainer, PrunerKind, SamplerKind, Study, StudyConfig,
    StudySummary,
};
use rw_types::{Direction, RwError, SearchSpace, Trial};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rungwise")]
#[command(about = "Hyperparameter search with early stopping for training jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run trials until the budget is spent, resuming any existing study.
    ///
    /// On ctrl-c the running trial is stopped and left unrecorded; the next
    /// run of the same study starts it again.
    Run(RunArgs),
    /// Print the best completed trial of a study
    Best {
        /// Study directory
        #[arg(long)]
        output_dir: PathBuf,
        /// Objective direction; must match the one the study was created with
        /// (default: the stored one)
        #[arg(long)]
        direction: Option<Direction>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Search space JSON file
    #[arg(long)]
    space: PathBuf,

    /// Study configuration JSON file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total number of trials, including resumed ones
    #[arg(long)]
    trials: Option<usize>,

    /// Checkpoint budget per trial (e.g. epochs)
    #[arg(long)]
    max_checkpoint: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    direction: Option<Direction>,

    #[arg(long, value_enum)]
    sampler: Option<SamplerArg>,

    #[arg(long, value_enum)]
    pruner: Option<PrunerArg>,

    #[arg(long)]
    reduction_factor: Option<f64>,

    /// Trials needed at a rung before anything is pruned there
    #[arg(long)]
    min_trials_per_rung: Option<usize>,

    #[arg(long, value_enum)]
    device: Option<DeviceArg>,

    /// Minimum free GPU memory (MB) for a device to be claimed
    #[arg(long)]
    required_free_mb: Option<u64>,

    /// Study directory (default: <data dir>/rungwise/<name>)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Study name
    #[arg(long)]
    name: Option<String>,

    /// Seconds a cancelled training command gets to exit before it is killed
    #[arg(long, default_value = "30")]
    grace_secs: u64,

    /// Training command and its arguments
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SamplerArg {
    Tpe,
    Random,
}

#[derive(Clone, Copy, ValueEnum)]
enum PrunerArg {
    Asha,
    Hyperband,
    None,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Gpu,
    Cpu,
}

impl RunArgs {
    fn study_config(&self) -> Result<StudyConfig> {
        let mut config = match &self.config {
            Some(path) => StudyConfig::from_file(path)?,
            None => StudyConfig::default(),
        };

        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(n) = self.trials {
            config.n_trials = n;
        }
        if let Some(max) = self.max_checkpoint {
            config.max_checkpoint = max;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(direction) = self.direction {
            config.direction = direction;
        }
        if let Some(sampler) = self.sampler {
            config.sampler = match sampler {
                SamplerArg::Tpe => SamplerKind::Tpe,
                SamplerArg::Random => SamplerKind::Random,
            };
        }
        if let Some(pruner) = self.pruner {
            config.pruner = match pruner {
                PrunerArg::Asha => PrunerKind::Asha,
                PrunerArg::Hyperband => PrunerKind::Hyperband,
                PrunerArg::None => PrunerKind::None,
            };
        }
        if let Some(r) = self.reduction_factor {
            config.successive_halving.reduction_factor = r;
        }
        if let Some(k) = self.min_trials_per_rung {
            config.successive_halving.min_trials_per_rung = k;
        }
        if let Some(device) = self.device {
            config.device = match device {
                DeviceArg::Gpu => DeviceKind::Gpu,
                DeviceArg::Cpu => DeviceKind::Cpu,
            };
        }
        if let Some(mb) = self.required_free_mb {
            config.resource.required_free_mb = mb;
        }

        config.validate()?;
        Ok(config)
    }

    fn trainer(&self) -> Result<ProcessTrainer> {
        let (program, args) = self
            .command
            .split_first()
            .context("missing training command after `--`")?;
        Ok(ProcessTrainer::new(program.clone(), args.to_vec())
            .with_grace_period(Duration::from_secs(self.grace_secs)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Best {
            output_dir,
            direction,
        } => best(&output_dir, direction),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn exit_status(e: &anyhow::Error) -> u8 {
    let fatal = e
        .chain()
        .any(|cause| cause.downcast_ref::<RwError>().is_some_and(RwError::is_fatal));
    if fatal {
        2
    } else {
        1
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let space = SearchSpace::from_file(&args.space)
        .with_context(|| format!("invalid search space {}", args.space.display()))?;
    let config = args.study_config().context("invalid study configuration")?;
    let mut trainer = args.trainer()?;

    let cancel = CancelFlag::new();
    let mut study = Study::builder(config, space)
        .cancel_flag(cancel.clone())
        .build()
        .context("failed to open study")?;

    let mut task = tokio::task::spawn_blocking(move || study.optimize(&mut trainer));

    let joined = tokio::select! {
        joined = &mut task => joined,
        interrupted = signal::ctrl_c() => {
            match interrupted {
                Ok(()) => {
                    warn!("interrupt received, stopping the running trial");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
            task.await
        }
    };
    let summary = joined.context("study task panicked")??;

    report(&summary)?;
    Ok(())
}

fn report(summary: &StudySummary) -> Result<()> {
    for warning in &summary.warnings {
        warn!("{warning}");
    }
    match &summary.best {
        Some(best) => info!(
            study = %summary.study,
            trial = best.id,
            final_metric = ?best.final_metric,
            completed = summary.n_completed,
            pruned = summary.n_pruned,
            failed = summary.n_failed,
            "study finished"
        ),
        None => warn!(study = %summary.study, trials = summary.n_trials, "no trial completed"),
    }
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn best(output_dir: &Path, direction: Option<Direction>) -> Result<()> {
    let trial = best_trial(output_dir, direction)?;
    println!("{}", serde_json::to_string_pretty(&trial)?);
    Ok(())
}

/// Best trial recomputed from the ledger, so it does not depend on
/// `best_trial.json` having been written.
fn best_trial(output_dir: &Path, direction: Option<Direction>) -> Result<Trial> {
    if !output_dir.join("trials").is_dir() {
        bail!("no study found in {}", output_dir.display());
    }
    let ledger = match direction {
        Some(direction) => JsonLedger::open(output_dir, direction),
        None => JsonLedger::open_existing(output_dir),
    }
    .with_context(|| format!("failed to open ledger in {}", output_dir.display()))?;

    let Some(trial) = ledger.best() else {
        bail!(
            "no completed trials among {} in {}",
            ledger.trials().len(),
            output_dir.display()
        );
    };
    Ok(trial)
}
