//! Kairo launcher
//!
//! Loads a configuration file, applies `--set` overrides and runs one task:
//! training, forwarding the `eval` dataset to a file, beam search or scoring.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use kairo_core::Config;
use kairo_engine::{Engine, open_dataset};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    Train,
    Forward,
    Search,
    Analyze,
}

/// CLI arguments
#[derive(Parser)]
#[command(name = "kairo")]
#[command(about = "Train and decode sequence models")]
#[command(version)]
struct Cli {
    /// Configuration file
    config: PathBuf,

    /// Task to run; defaults to the config's `task` or `train`
    #[arg(short, long, value_enum)]
    task: Option<Task>,

    /// Override a config key, `key=value`
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::new();
    config
        .load_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    for item in &cli.overrides {
        let Some((key, value)) = item.split_once('=') else {
            bail!("override {item:?} is not key=value");
        };
        config.add_line(key.trim(), value.trim());
    }
    Ok(config)
}

fn dataset_desc(config: &Config, key: &str) -> Result<String> {
    config
        .value_opt(key)
        .with_context(|| format!("config key {key:?} naming a dataset is required"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let task = match cli.task {
        Some(task) => task,
        None => match config.value("task", "train").as_str() {
            "train" => Task::Train,
            "forward" => Task::Forward,
            "search" => Task::Search,
            "analyze" => Task::Analyze,
            other => bail!("unknown task {other:?}"),
        },
    };
    info!(config = %cli.config.display(), ?task, "starting");

    let mut engine = Engine::new(config.clone())?;
    match task {
        Task::Train => {
            let mut train = open_dataset(&dataset_desc(&config, "train")?, &config)?;
            let mut dev = match config.value_opt("dev") {
                Some(desc) => Some(open_dataset(&desc, &config)?),
                None => None,
            };
            engine.init_train_from_config(train.as_ref(), dev.as_deref())?;
            let result = match dev.as_mut() {
                Some(dev) => engine.train(train.as_mut(), Some(dev.as_mut())),
                None => engine.train(train.as_mut(), None),
            };
            result.context("training failed")?;
        }
        Task::Forward => {
            let mut data = open_dataset(&dataset_desc(&config, "eval")?, &config)?;
            let output = config.value("output_file", "forward.safetensors");
            let batch_size = config.usize("batch_size", 5000)?;
            engine.init_network_from_config(Some(data.as_ref()))?;
            let seqs = engine.forward_to_file(data.as_mut(), output.as_ref(), batch_size)?;
            info!(seqs, output = %output, "forward done");
        }
        Task::Search => {
            let mut data = open_dataset(&dataset_desc(&config, "eval")?, &config)?;
            engine.init_network_from_config(Some(data.as_ref()))?;
            for hyp in engine.search(data.as_mut())? {
                let labels: Vec<String> = hyp.labels.iter().map(u32::to_string).collect();
                println!("{}\t{}", hyp.tag, labels.join(" "));
            }
            for (layer, error) in engine.error_by_layer() {
                info!(layer = %layer, error, "search error");
            }
        }
        Task::Analyze => {
            let mut data = open_dataset(&dataset_desc(&config, "eval")?, &config)?;
            engine.init_network_from_config(Some(data.as_ref()))?;
            let stats = engine.analyze(data.as_mut())?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "num_seqs": stats.num_seqs,
                "frames": stats.frames,
                "scores": stats.scores,
                "errors": stats.errors,
            }))?);
        }
    }
    Ok(())
}
