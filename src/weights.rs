use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{ensure, Context};
use burn::{prelude::*, tensor::Distribution};
use itertools::Itertools;
use log::info;
use serde::Deserialize;

use crate::{model::LinearQNet, trace::tensor_values};

/// Explicit weights: one value for every entry, one row per action, or draws from a normal
/// distribution.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Weights {
    Fill(f32),
    Matrix(Vec<Vec<f32>>),
    Normal { mean: f32, stddev: f32 },
}

#[derive(Deserialize, Debug)]
struct WeightsFile {
    weights: Weights,
}

impl Weights {
    /// Parses `{"weights": 1.0}`, `{"weights": [[..], ..]}` or
    /// `{"weights": {"mean": 0.0, "stddev": 1.0}}`.
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let file: WeightsFile = serde_json::from_str(s).context("invalid weights document")?;
        Ok(file.weights)
    }

    /// Replaces the weights of `model`. Shapes are checked by [`LinearQNet::with_weights`].
    pub fn apply<B: Backend>(&self, model: LinearQNet<B>) -> anyhow::Result<LinearQNet<B>> {
        let (features, actions) = (model.feature_dim(), model.action_dim());
        match self {
            Weights::Fill(v) => model.with_weights(&vec![vec![*v; features]; actions]),
            Weights::Matrix(rows) => model.with_weights(rows),
            Weights::Normal { mean, stddev } => {
                ensure!(
                    mean.is_finite() && stddev.is_finite() && *stddev >= 0.0,
                    "invalid normal weights: mean {}, stddev {}",
                    mean,
                    stddev
                );
                let values = tensor_values(Tensor::<B, 2>::random(
                    [actions, features],
                    Distribution::Normal(*mean as f64, *stddev as f64),
                    &model.device(),
                ))?;
                let rows = values.chunks(features).map(|r| r.to_vec()).collect_vec();
                model.with_weights(&rows)
            }
        }
    }
}

pub fn load_weights(path: impl AsRef<Path>) -> anyhow::Result<Weights> {
    let path = path.as_ref();
    let s = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Weights::from_json(&s).with_context(|| format!("failed to parse {:?}", path))
}

/// Writes the weight matrix as CSV: one line per action, features separated by commas.
pub fn write_csv<B: Backend>(model: &LinearQNet<B>, w: &mut impl Write) -> anyhow::Result<()> {
    let features = model.feature_dim();
    let values = tensor_values(model.weight())?;
    for row in values.chunks(features) {
        writeln!(w, "{}", row.iter().join(","))?;
    }
    Ok(())
}

pub fn dump_weights<B: Backend>(model: &LinearQNet<B>, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let f = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let mut w = BufWriter::new(f);
    write_csv(model, &mut w)?;
    w.flush()?;
    info!("wrote weights to {:?}", path);
    Ok(())
}

/// Reads rows written by [`write_csv`]. Blank lines are skipped.
pub fn read_csv(r: impl BufRead) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut rows = Vec::new();
    for (i, line) in r.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(',')
            .enumerate()
            .map(|(j, v)| {
                v.trim()
                    .parse::<f32>()
                    .with_context(|| format!("failed to read weight at line {}, column {}", i + 1, j + 1))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn load_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<Vec<f32>>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    read_csv(BufReader::new(f)).with_context(|| format!("failed to parse {:?}", path))
}
