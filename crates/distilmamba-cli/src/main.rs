use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use config::{load_config, AppConfig};
use distilmamba_train::PoolingMode;

/// distilmamba: distil a fine-tuned Mamba emotion classifier into a smaller student
#[derive(Debug, Parser)]
#[command(name = "distilmamba", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides shared by every training and inference command.
#[derive(Debug, Args)]
struct RunArgs {
    /// Directory with `train.jsonl` and `test.jsonl`.
    #[arg(long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Directory for checkpoints, manifest and tokenizer files.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Percentage of every split to use (default 1).
    #[arg(long)]
    subset_percent: Option<f64>,

    /// Examples per batch (default 8).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Token sequence length after truncation and padding (default 64).
    #[arg(long)]
    max_length: Option<usize>,

    /// Sequence pooling before the classification head: "mean" or "max".
    #[arg(long, value_name = "MODE")]
    pooling: Option<PoolingMode>,

    /// Run on the CPU even when a GPU is available.
    #[arg(long)]
    cpu: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(ref d) = self.data {
            cfg.data.dir = d.to_string_lossy().into_owned();
        }
        if let Some(ref o) = self.output {
            cfg.output.dir = o.to_string_lossy().into_owned();
        }
        if let Some(p) = self.subset_percent {
            cfg.data.subset_percent = p;
        }
        if let Some(b) = self.batch_size {
            cfg.data.batch_size = b;
        }
        if let Some(l) = self.max_length {
            cfg.data.max_length = l;
        }
        if let Some(p) = self.pooling {
            cfg.model.pooling = p;
        }
        if self.cpu {
            cfg.device.prefer_gpu = false;
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the base model from Hugging Face Hub.
    Pull {
        /// Hugging Face model id (default `state-spaces/mamba-130m-hf`).
        #[arg(long, short = 'm')]
        model: Option<String>,

        /// Git revision, branch, or commit hash.
        #[arg(long)]
        revision: Option<String>,
    },

    /// Fine-tune the teacher classifier and save the best epoch.
    TrainTeacher {
        #[command(flatten)]
        args: RunArgs,

        /// Maximum teacher epochs (default 10).
        #[arg(long)]
        epochs: Option<usize>,
    },

    /// Distil the saved teacher into a freshly initialised student.
    Distill {
        #[command(flatten)]
        args: RunArgs,

        /// Distillation epochs (default 3).
        #[arg(long)]
        epochs: Option<usize>,

        /// Softening temperature (default 2.0).
        #[arg(long)]
        temperature: Option<f64>,

        /// Weight of the soft-target term (default 0.5).
        #[arg(long)]
        alpha: Option<f64>,
    },

    /// Full pipeline: teacher fine-tuning, distillation, final statistics.
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Maximum teacher epochs (default 10).
        #[arg(long)]
        teacher_epochs: Option<usize>,

        /// Distillation epochs (default 3).
        #[arg(long)]
        distill_epochs: Option<usize>,
    },

    /// Accuracy and prediction distribution of both saved models.
    Evaluate {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Classify texts with both saved models.
    Predict {
        #[command(flatten)]
        args: RunArgs,

        /// Texts to classify; defaults to six demonstration sentences.
        texts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let mut cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Pull { model, revision } => {
            if let Some(m) = model {
                cfg.model.id = m;
            }
            if let Some(r) = revision {
                cfg.model.revision = r;
            }
            commands::pull::run(&cfg).await?;
        }
        Commands::TrainTeacher { args, epochs } => {
            args.apply(&mut cfg);
            if let Some(e) = epochs {
                cfg.teacher.epochs = e;
            }
            commands::train_teacher::run(&cfg).await?;
        }
        Commands::Distill { args, epochs, temperature, alpha } => {
            args.apply(&mut cfg);
            if let Some(e) = epochs {
                cfg.distill.epochs = e;
            }
            if let Some(t) = temperature {
                cfg.distill.temperature = t;
            }
            if let Some(a) = alpha {
                cfg.distill.alpha = a;
            }
            commands::distill::run(&cfg).await?;
        }
        Commands::Run { args, teacher_epochs, distill_epochs } => {
            args.apply(&mut cfg);
            if let Some(e) = teacher_epochs {
                cfg.teacher.epochs = e;
            }
            if let Some(e) = distill_epochs {
                cfg.distill.epochs = e;
            }
            commands::run::run(&cfg).await?;
        }
        Commands::Evaluate { args } => {
            args.apply(&mut cfg);
            commands::evaluate::run(&cfg)?;
        }
        Commands::Predict { args, texts } => {
            args.apply(&mut cfg);
            commands::predict::run(&texts, &cfg)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
