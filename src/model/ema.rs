//! Exponential moving average of generator parameters.
//!
//! The averaged copy is what gets sampled from; it is refreshed once per
//! generator update and never after a discriminator-only update. Only
//! trainable parameters are averaged.

use burn::{
    module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

#[derive(Debug, Clone, Copy)]
pub struct ParameterAverager {
    decay: f64,
}

impl ParameterAverager {
    pub fn new(decay: f64) -> Self {
        Self { decay }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Starting point of the average: an exact copy, no decay applied.
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self, live: &M) -> M::InnerModule {
        live.valid()
    }

    /// `decay * averaged + (1 - decay) * live` for every trainable parameter.
    ///
    /// Both modules must share a structure; tensors are paired in visiting
    /// order. Tensors that take no gradient in `live`, such as batch norm
    /// running statistics, are copied from `live` unchanged.
    pub fn update<B, M>(&self, averaged: &M::InnerModule, live: &M) -> M::InnerModule
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut trainable = TrainableFlags::default();
        live.visit(&mut trainable);

        let mut collector = Collector::default();
        averaged.visit(&mut collector);

        let mut blend = Blend {
            averaged: collector.tensors.into_iter(),
            trainable: trainable.flags.into_iter(),
            decay: self.decay,
        };
        live.valid().map(&mut blend)
    }
}

/// Every float tensor of a module, flattened, in visiting order.
pub fn parameter_values<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
    let mut collector = Collector::default();
    module.visit(&mut collector);
    collector
        .tensors
        .into_iter()
        .map(|tensor| {
            tensor
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap_or_default()
        })
        .collect()
}

struct Collector<B: Backend> {
    tensors: Vec<Tensor<B, 1>>,
}

impl<B: Backend> Default for Collector<B> {
    fn default() -> Self {
        Self {
            tensors: Vec::new(),
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.tensors.push(tensor.clone().reshape([numel]));
    }
}

/// Whether each float tensor, in visiting order, is updated by the optimizer.
#[derive(Default)]
struct TrainableFlags {
    flags: Vec<bool>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for TrainableFlags {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.flags.push(tensor.is_require_grad());
    }
}

struct Blend<B: Backend> {
    averaged: std::vec::IntoIter<Tensor<B, 1>>,
    trainable: std::vec::IntoIter<bool>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let averaged = self.averaged.next();
        match (averaged, self.trainable.next()) {
            (Some(averaged), Some(true)) => {
                let averaged = averaged.reshape(tensor.dims());
                averaged.mul_scalar(self.decay) + tensor.mul_scalar(1.0 - self.decay)
            }
            _ => tensor,
        }
    }
}
