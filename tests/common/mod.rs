#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use biggan::model::{
    architecture::{ImageSize, ModelConfig},
    data::{ImageBatch, image_loader, in_memory_dataset},
    training::TrainingConfig,
};
use burn::{
    backend::{Autodiff, NdArray},
    data::dataloader::DataLoader,
    optim::AdamConfig,
    prelude::*,
    tensor::Distribution,
};

pub type TestBackend = Autodiff<NdArray<f32>>;
pub type TestDevice = <TestBackend as Backend>::Device;

/// Smallest network the 128px topology allows, writing under `root`.
pub fn tiny_config(root: &Path) -> TrainingConfig {
    let model = ModelConfig::new(ImageSize::X128)
        .with_base_channels(1)
        .with_noise_dim(4)
        .with_channels(1);
    let dir = |name: &str| root.join(name).display().to_string();
    TrainingConfig::new(
        model,
        AdamConfig::new().with_beta_1(0.0).with_beta_2(0.9),
        AdamConfig::new().with_beta_1(0.0).with_beta_2(0.9),
        dir("checkpoint"),
        dir("results"),
        dir("logs"),
        dir("samples"),
        dir("dataset"),
    )
    .with_batch_size(2)
    .with_print_freq(1000)
    .with_save_freq(1000)
    .with_sample_count(1)
    .with_test_count(2)
}

pub type TestLoader = Arc<dyn DataLoader<TestBackend, ImageBatch<TestBackend>>>;

/// Four random 128px single-channel images served in batches of two.
pub fn random_loader(device: &TestDevice) -> TestLoader {
    let images = Tensor::<NdArray<f32>, 4>::random(
        [4, 1, 128, 128],
        Distribution::Uniform(-1.0, 1.0),
        device,
    );
    loader_over(images)
}

/// Batches of two over `images`.
pub fn loader_over(images: Tensor<NdArray<f32>, 4>) -> TestLoader {
    let (dataset, batcher) = in_memory_dataset(images).unwrap();
    image_loader(dataset, batcher, 2, 11, 1)
}
