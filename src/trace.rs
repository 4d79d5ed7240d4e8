//! Recording and replay of forward passes.
//!
//! A [`Tracer`] executes tensor operations and appends every one of them to a [`Graph`]. The
//! resulting [`TracedModule`] owns the graph together with the parameter values it references,
//! so it can be saved, loaded and executed without the module that produced it.
//!
//! Values are numbered in execution order: value 0 is the graph input and node `i` produces
//! value `i + 1`.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{anyhow, bail, ensure, Context};
use burn::{nn::Linear, prelude::*};
use log::{debug, info};
use serde::{Deserialize, Serialize};

pub const TRACE_FORMAT: &str = "linear_qnet/trace";
pub const TRACE_VERSION: u32 = 1;

pub type ValueId = usize;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Op {
    /// `value[lhs] · params[rhs]`
    MatMul { lhs: ValueId, rhs: String },
    /// `value[lhs] + params[bias]`, with `bias` a `[1, n]` row broadcast over the batch
    AddBias { lhs: ValueId, bias: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    /// Shape produced while tracing
    pub shape: Vec<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Graph {
    /// Shape of the example input. Only the trailing dimension is fixed on replay.
    pub input: Vec<usize>,
    pub nodes: Vec<Node>,
    pub output: ValueId,
}

impl Graph {
    pub fn count_ops(&self, f: impl Fn(&Op) -> bool) -> usize {
        self.nodes.iter().filter(|n| f(&n.op)).count()
    }
}

pub struct TracedTensor<B: Backend> {
    pub id: ValueId,
    pub tensor: Tensor<B, 2>,
}

pub struct Tracer<B: Backend> {
    graph: Graph,
    params: BTreeMap<String, Tensor<B, 2>>,
}

impl<B: Backend> Default for Tracer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Tracer<B> {
    pub fn new() -> Self {
        Self {
            graph: Graph::default(),
            params: BTreeMap::new(),
        }
    }

    pub fn input(&mut self, x: Tensor<B, 2>) -> TracedTensor<B> {
        debug_assert!(self.graph.nodes.is_empty(), "input must be traced first");
        self.graph.input = x.dims().to_vec();
        TracedTensor { id: 0, tensor: x }
    }

    /// Executes `layer` on `x`, recording its weight (and bias) under `name`.
    pub fn linear(&mut self, name: &str, layer: &Linear<B>, x: TracedTensor<B>) -> TracedTensor<B> {
        let weight_name = format!("{}.weight", name);
        let weight = layer.weight.val();
        self.params.insert(weight_name.clone(), weight.clone());
        let out = x.tensor.matmul(weight);
        let mut out = self.push(
            Op::MatMul {
                lhs: x.id,
                rhs: weight_name,
            },
            out,
        );

        if let Some(bias) = &layer.bias {
            let bias_name = format!("{}.bias", name);
            let bias = bias.val().unsqueeze::<2>();
            self.params.insert(bias_name.clone(), bias.clone());
            let tensor = out.tensor + bias;
            out = self.push(
                Op::AddBias {
                    lhs: out.id,
                    bias: bias_name,
                },
                tensor,
            );
        }

        out
    }

    fn push(&mut self, op: Op, tensor: Tensor<B, 2>) -> TracedTensor<B> {
        self.graph.nodes.push(Node {
            op,
            shape: tensor.dims().to_vec(),
        });
        TracedTensor {
            id: self.graph.nodes.len(),
            tensor,
        }
    }

    pub fn finish(mut self, output: TracedTensor<B>) -> TracedModule<B> {
        self.graph.output = output.id;
        debug!(
            "traced {} ops over {} params",
            self.graph.nodes.len(),
            self.params.len()
        );
        TracedModule {
            graph: self.graph,
            params: self.params,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracedModule<B: Backend> {
    graph: Graph,
    params: BTreeMap<String, Tensor<B, 2>>,
}

impl<B: Backend> TracedModule<B> {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn param(&self, name: &str) -> Option<&Tensor<B, 2>> {
        self.params.get(name)
    }

    /// Replays the recorded operations on `x`, which may have any batch size.
    pub fn forward(&self, x: Tensor<B, 2>) -> anyhow::Result<Tensor<B, 2>> {
        let expected = self.graph.input.last().copied().unwrap_or_default();
        let [_, features] = x.dims();
        ensure!(
            features == expected,
            "input has {} features, traced graph expects {}",
            features,
            expected
        );

        let mut values = vec![x];
        for (i, node) in self.graph.nodes.iter().enumerate() {
            let out = match &node.op {
                Op::MatMul { lhs, rhs } => self.value(&values, *lhs)?.matmul(self.lookup(rhs)?),
                Op::AddBias { lhs, bias } => self.value(&values, *lhs)? + self.lookup(bias)?,
            };
            debug_assert_eq!(values.len(), i + 1);
            values.push(out);
        }

        self.value(&values, self.graph.output)
    }

    fn value(&self, values: &[Tensor<B, 2>], id: ValueId) -> anyhow::Result<Tensor<B, 2>> {
        values
            .get(id)
            .cloned()
            .with_context(|| format!("graph references undefined value {}", id))
    }

    fn lookup(&self, name: &str) -> anyhow::Result<Tensor<B, 2>> {
        self.params
            .get(name)
            .cloned()
            .with_context(|| format!("graph references unknown parameter {}", name))
    }

    /// Writes the traced graph to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let artifact = self.to_artifact()?;
        let f = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        let mut w = BufWriter::new(f);
        rmp_serde::encode::write_named(&mut w, &artifact)?;
        w.flush()?;
        info!("saved traced graph to {:?}", path);
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, device: &B::Device) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let artifact: TraceArtifact = rmp_serde::from_read(BufReader::new(f))
            .with_context(|| format!("failed to decode {:?}", path))?;
        Self::from_artifact(artifact, device)
    }

    fn to_artifact(&self) -> anyhow::Result<TraceArtifact> {
        let mut params = BTreeMap::new();
        for (name, tensor) in &self.params {
            let [rows, cols] = tensor.dims();
            let values = tensor_values(tensor.clone())?;
            params.insert(
                name.clone(),
                ParamRecord {
                    shape: [rows, cols],
                    values,
                },
            );
        }

        Ok(TraceArtifact {
            format: TRACE_FORMAT.to_string(),
            version: TRACE_VERSION,
            graph: self.graph.clone(),
            params,
        })
    }

    fn from_artifact(artifact: TraceArtifact, device: &B::Device) -> anyhow::Result<Self> {
        if artifact.format != TRACE_FORMAT {
            bail!("not a traced graph: format {:?}", artifact.format);
        }
        ensure!(
            artifact.version == TRACE_VERSION,
            "unsupported trace version: {}",
            artifact.version
        );

        let mut params = BTreeMap::new();
        for (name, record) in artifact.params {
            let [rows, cols] = record.shape;
            let len = rows
                .checked_mul(cols)
                .with_context(|| format!("parameter {} has invalid shape {:?}", name, record.shape))?;
            ensure!(
                record.values.len() == len,
                "parameter {} has {} values, expected {}",
                name,
                record.values.len(),
                len
            );
            let tensor = Tensor::<B, 2>::from_data(TensorData::new(record.values, [rows, cols]), device);
            params.insert(name, tensor);
        }

        let module = Self {
            graph: artifact.graph,
            params,
        };
        module.check_shapes()?;
        Ok(module)
    }

    /// Walks the graph and checks every op against the shapes of its operands, so replay never
    /// hands mismatched tensors to the backend.
    fn check_shapes(&self) -> anyhow::Result<()> {
        let input = *self
            .graph
            .input
            .last()
            .context("traced graph has no input shape")?;
        // trailing dimension of every value
        let mut cols = vec![input];
        for (i, node) in self.graph.nodes.iter().enumerate() {
            let out = match &node.op {
                Op::MatMul { lhs, rhs } => {
                    let lhs_cols = *cols
                        .get(*lhs)
                        .with_context(|| format!("node {} references undefined value {}", i, lhs))?;
                    let [rows, rhs_cols] = self.lookup(rhs)?.dims();
                    ensure!(
                        lhs_cols == rows,
                        "node {}: cannot multiply {} columns by parameter {} with {} rows",
                        i,
                        lhs_cols,
                        rhs,
                        rows
                    );
                    rhs_cols
                }
                Op::AddBias { lhs, bias } => {
                    let lhs_cols = *cols
                        .get(*lhs)
                        .with_context(|| format!("node {} references undefined value {}", i, lhs))?;
                    let shape = self.lookup(bias)?.dims();
                    ensure!(
                        shape == [1, lhs_cols],
                        "node {}: bias {} has shape {:?}, expected [1, {}]",
                        i,
                        bias,
                        shape,
                        lhs_cols
                    );
                    lhs_cols
                }
            };
            cols.push(out);
        }
        ensure!(
            self.graph.output < cols.len(),
            "graph output references undefined value {}",
            self.graph.output
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct TraceArtifact {
    format: String,
    version: u32,
    graph: Graph,
    params: BTreeMap<String, ParamRecord>,
}

#[derive(Serialize, Deserialize, Debug)]
struct ParamRecord {
    shape: [usize; 2],
    /// Row-major
    values: Vec<f32>,
}

pub fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("unable to read tensor values: {:?}", e))
}
