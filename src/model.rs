use anyhow::{ensure, Context};
use burn::{
    module::Param,
    nn::{Linear, LinearConfig},
    prelude::*,
};
use log::debug;

use crate::trace::{tensor_values, TracedModule, TracedTensor, Tracer};

/// Single bias-free linear layer scoring every action for a feature vector.
#[derive(Module, Debug)]
pub struct LinearQNet<B: Backend> {
    fc: Linear<B>,
}

#[derive(Config, Debug)]
pub struct QNetConfig {
    pub feature_dim: usize,
    pub action_dim: usize,
}

impl QNetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.feature_dim > 0,
            "invalid feature dimension: {}, must be positive",
            self.feature_dim
        );
        ensure!(
            self.action_dim > 0,
            "invalid action dimension: {}, must be positive",
            self.action_dim
        );
        Ok(())
    }

    /// Returns the model with the framework's default weight initialization.
    pub fn init<B: Backend>(&self, device: &B::Device) -> anyhow::Result<LinearQNet<B>> {
        self.validate()?;
        debug!(
            "initializing linear q-network: {} features, {} actions",
            self.feature_dim, self.action_dim
        );
        Ok(LinearQNet {
            fc: LinearConfig::new(self.feature_dim, self.action_dim)
                .with_bias(false)
                .init(device),
        })
    }
}

impl<B: Backend> LinearQNet<B> {
    /// # Shapes
    ///   - Features [batch_size, feature_dim]
    ///   - Output [batch_size, action_dim]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(features)
    }

    pub fn feature_dim(&self) -> usize {
        self.fc.weight.val().dims()[0]
    }

    pub fn action_dim(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    pub fn device(&self) -> B::Device {
        self.fc.weight.val().device()
    }

    pub fn has_bias(&self) -> bool {
        self.fc.bias.is_some()
    }

    /// Weight matrix as `[action_dim, feature_dim]`, one row per action.
    ///
    /// burn stores linear weights as `[d_input, d_output]`, so this is the transpose of the
    /// stored parameter.
    pub fn weight(&self) -> Tensor<B, 2> {
        self.fc.weight.val().transpose()
    }

    /// Replaces the weight matrix. `rows` holds one row of `feature_dim` values per action.
    pub fn with_weights(self, rows: &[Vec<f32>]) -> anyhow::Result<Self> {
        let (feature_dim, action_dim) = (self.feature_dim(), self.action_dim());
        ensure!(
            rows.len() == action_dim,
            "weights array size {} does not match action dimension {}",
            rows.len(),
            action_dim
        );
        for (i, row) in rows.iter().enumerate() {
            ensure!(
                row.len() == feature_dim,
                "weights[{}] size {} does not match feature dimension {}",
                i,
                row.len(),
                feature_dim
            );
        }

        let device = self.device();
        let values: Vec<f32> = rows.iter().flatten().copied().collect();
        let weight =
            Tensor::<B, 2>::from_data(TensorData::new(values, [action_dim, feature_dim]), &device)
                .transpose();

        Ok(Self {
            fc: Linear {
                weight: Param::from_tensor(weight),
                bias: None,
            },
        })
    }

    /// Action values for a single state.
    pub fn action_values(&self, state: &[f32]) -> anyhow::Result<Vec<f32>> {
        ensure!(
            state.len() == self.feature_dim(),
            "state has {} features, expected {}",
            state.len(),
            self.feature_dim()
        );
        let device = self.device();
        let input =
            Tensor::<B, 2>::from_data(TensorData::new(state.to_vec(), [1, state.len()]), &device);
        tensor_values(self.forward(input)).context("failed to read action values")
    }

    /// Framework description followed by every parameter name and shape.
    pub fn describe(&self) -> String {
        let [actions, features] = self.weight().dims();
        let mut s = format!("{}\nfc.weight: [{}, {}]", self, actions, features);
        if !self.has_bias() {
            s.push_str("\nfc.bias: none");
        }
        s
    }

    /// Runs `forward` once on `example` and records every executed operation.
    pub fn trace(&self, example: Tensor<B, 2>) -> TracedModule<B> {
        let mut tracer = Tracer::new();
        let x = tracer.input(example);
        let out = self.forward_traced(x, &mut tracer);
        tracer.finish(out)
    }

    fn forward_traced(&self, x: TracedTensor<B>, tracer: &mut Tracer<B>) -> TracedTensor<B> {
        tracer.linear("fc", &self.fc, x)
    }
}
