use anyhow::Context;
use burn::prelude::*;
use clap::Parser;
use itertools::Itertools;
use linear_qnet::{
    trace::{tensor_values, TracedModule},
    DefaultBackend,
};
use log::{debug, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Load a traced q-network and print the action values for one state
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Traced graph written by linear_qnet
    model: String,

    #[clap(required = true, num_args = 1.., allow_negative_numbers = true)]
    features: Vec<f32>,

    #[clap(short = 'v', long, action)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto)?;

    let device = Default::default();
    let traced = TracedModule::<DefaultBackend>::load(&args.model, &device)?;
    debug!("loaded {:?}", traced.graph());

    let n = args.features.len();
    let input = Tensor::<DefaultBackend, 2>::from_data(TensorData::new(args.features, [1, n]), &device);
    let q = tensor_values(traced.forward(input)?).context("failed to read action values")?;

    println!("{}", q.iter().join(","));
    if let Some((best, _)) = q.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)) {
        println!("greedy action: {}", best);
    }

    Ok(())
}
