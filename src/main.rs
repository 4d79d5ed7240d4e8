use std::io;

use anyhow::bail;
use clap::Parser;
use linear_qnet::{
    export::{export, ExportConfig},
    model::QNetConfig,
    DefaultBackend,
};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Build a bias-free linear q-network and save a traced forward pass
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Length of the feature vector
    feature_dim: usize,

    /// Number of actions scored by the network
    action_dim: usize,

    #[clap(short, long, default_value = "qnet.pt")]
    output: String,

    #[clap(long)]
    seed: Option<u64>,

    /// JSON weights: {"weights": 1.0}, {"weights": [[...], ...]} or
    /// {"weights": {"mean": 0.0, "stddev": 1.0}}
    #[clap(long)]
    weights: Option<String>,

    /// CSV weight matrix written by --dump-weights
    #[clap(long, conflicts_with = "weights")]
    load_weights: Option<String>,

    /// Also write the weight matrix as CSV, one row per action
    #[clap(long)]
    dump_weights: Option<String>,

    #[clap(short = 'v', long, action, default_value_t = 1)]
    verbosity: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        4 => LevelFilter::Trace,
        _ => bail!(
            "invalid log level: {}, must be between 0 and 4",
            args.verbosity
        ),
    };
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto)?;

    let config = ExportConfig::new(QNetConfig::new(args.feature_dim, args.action_dim))
        .with_output(args.output)
        .with_seed(args.seed)
        .with_weights(args.weights)
        .with_load_weights(args.load_weights)
        .with_dump_weights(args.dump_weights);

    let device = Default::default();
    let traced = export::<DefaultBackend>(&config, &device, &mut io::stdout().lock())?;
    info!(
        "exported {} ops to {}",
        traced.graph().nodes.len(),
        config.output
    );

    Ok(())
}
