use std::io::Write;

use anyhow::{bail, Context};
use burn::{prelude::*, tensor::Distribution};
use log::{debug, info};

use crate::{
    model::QNetConfig,
    trace::TracedModule,
    weights::{dump_weights, load_csv, load_weights},
};

#[derive(Config, Debug)]
pub struct ExportConfig {
    pub model: QNetConfig,
    #[config(default = "String::from(\"qnet.pt\")")]
    pub output: String,
    /// Seed for the backend rng, used by the default initializer and the example input
    #[config(default = "None")]
    pub seed: Option<u64>,
    /// JSON document with explicit weights, see [`crate::weights::Weights`]
    #[config(default = "None")]
    pub weights: Option<String>,
    /// CSV weight matrix as written by `dump_weights`, one row per action
    #[config(default = "None")]
    pub load_weights: Option<String>,
    /// Optional CSV dump of the exported weight matrix
    #[config(default = "None")]
    pub dump_weights: Option<String>,
}

/// Builds the q-network, prints its description to `out`, traces one forward pass on a standard
/// normal example input and saves the traced graph to `config.output`.
pub fn export<B: Backend>(
    config: &ExportConfig,
    device: &B::Device,
    out: &mut impl Write,
) -> anyhow::Result<TracedModule<B>> {
    info!("starting export: {}", config.output);
    config.model.validate()?;
    if config.weights.is_some() && config.load_weights.is_some() {
        bail!("weights and load_weights are mutually exclusive");
    }

    if let Some(seed) = config.seed {
        debug!("seeding backend with {}", seed);
        B::seed(seed);
    }

    let mut model = config.model.init::<B>(device)?;
    if let Some(path) = &config.weights {
        model = load_weights(path)?
            .apply(model)
            .with_context(|| format!("failed to apply weights from {}", path))?;
        info!("initialized weights from {}", path);
    }
    if let Some(path) = &config.load_weights {
        model = model
            .with_weights(&load_csv(path)?)
            .with_context(|| format!("failed to apply weights from {}", path))?;
        info!("loaded weights from {}", path);
    }

    writeln!(out, "{}", model.describe())?;

    let example = Tensor::<B, 2>::random(
        [1, config.model.feature_dim],
        Distribution::Normal(0.0, 1.0),
        device,
    );
    let traced = model.trace(example);
    traced.save(&config.output)?;

    if let Some(path) = &config.dump_weights {
        dump_weights(&model, path)?;
    }

    Ok(traced)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use burn::backend::NdArray;
    use tempfile::tempdir;

    use super::*;
    use crate::trace::tensor_values;

    type TestBackend = NdArray;

    fn config_in(dir: &std::path::Path, f: usize, a: usize) -> ExportConfig {
        ExportConfig::new(QNetConfig::new(f, a))
            .with_output(dir.join("qnet.pt").to_string_lossy().to_string())
    }

    #[test]
    fn test_export_writes_trace() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path(), 4, 2);
        let mut out = Vec::new();
        let traced = export::<TestBackend>(&config, &Default::default(), &mut out).unwrap();

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("fc.weight: [2, 4]"), "{}", printed);
        assert!(dir.path().join("qnet.pt").exists());
        assert_eq!(traced.graph().input, vec![1, 4]);
    }

    #[test]
    fn test_export_zero_dimension() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path(), 0, 5);
        let mut out = Vec::new();
        assert!(export::<TestBackend>(&config, &Default::default(), &mut out).is_err());
        assert!(out.is_empty());
        assert!(!dir.path().join("qnet.pt").exists());
    }

    #[test]
    fn test_export_with_weights() {
        let dir = tempdir().unwrap();
        let weights = dir.path().join("weights.json");
        fs::write(&weights, r#"{"weights": [[1, 2, 3, 4], [1, -2, -3, -4]]}"#).unwrap();
        let csv = dir.path().join("weights.csv");

        let config = config_in(dir.path(), 4, 2)
            .with_weights(Some(weights.to_string_lossy().to_string()))
            .with_dump_weights(Some(csv.to_string_lossy().to_string()));
        let device = Default::default();
        let traced = export::<TestBackend>(&config, &device, &mut Vec::new()).unwrap();

        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 1.0], [1, 4]),
            &device,
        );
        let q = tensor_values(traced.forward(x).unwrap()).unwrap();
        assert_eq!(q, vec![18.0, -16.0]);
        assert_eq!(fs::read_to_string(csv).unwrap(), "1,2,3,4\n1,-2,-3,-4\n");
    }

    #[test]
    fn test_export_mismatched_weights() {
        let dir = tempdir().unwrap();
        let weights = dir.path().join("weights.json");
        fs::write(&weights, r#"{"weights": [[1, 2, 3]]}"#).unwrap();

        let config = config_in(dir.path(), 4, 2)
            .with_weights(Some(weights.to_string_lossy().to_string()));
        assert!(export::<TestBackend>(&config, &Default::default(), &mut Vec::new()).is_err());
        assert!(!dir.path().join("qnet.pt").exists());
    }

    #[test]
    fn test_export_reloads_dumped_weights() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("weights.csv");
        fs::write(&csv, "1,2,3,4\n1,-2,-3,-4\n").unwrap();

        let config =
            config_in(dir.path(), 4, 2).with_load_weights(Some(csv.to_string_lossy().to_string()));
        let device = Default::default();
        let traced = export::<TestBackend>(&config, &device, &mut Vec::new()).unwrap();

        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 1.0], [1, 4]),
            &device,
        );
        assert_eq!(tensor_values(traced.forward(x).unwrap()).unwrap(), vec![18.0, -16.0]);

        let both = config.with_weights(Some(csv.to_string_lossy().to_string()));
        assert!(export::<TestBackend>(&both, &device, &mut Vec::new()).is_err());
    }
}
