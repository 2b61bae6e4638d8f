//! Preview grids and test images drawn from the averaged generator.

use std::path::PathBuf;

use burn::{prelude::*, tensor::Distribution};
use tracing::info;

use crate::error::Result;
use crate::model::architecture::Synthesizer;
use crate::model::constants::MODEL_NAME;
use crate::model::training::{RunPaths, TrainingConfig};
use crate::utils::{grid_side, save_grid};

pub struct Sampler<B: Backend> {
    /// Fixed noise so successive training grids are comparable.
    sample_noise: Tensor<B, 2>,
    sample_side: usize,
    preview_side: usize,
    sample_dir: PathBuf,
    result_dir: PathBuf,
    device: B::Device,
}

impl<B: Backend> Sampler<B> {
    pub fn new(config: &TrainingConfig, paths: &RunPaths, device: &B::Device) -> Self {
        let noise_dim = config.model.noise_dim;
        let sample_side = grid_side(config.sample_count).max(1);
        let preview_side = grid_side(config.sample_count.min(config.batch_size)).max(1);
        let sample_noise = Tensor::random(
            [sample_side * sample_side, noise_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        );
        Self {
            sample_noise,
            sample_side,
            preview_side,
            sample_dir: paths.samples.clone(),
            result_dir: paths.results.clone(),
            device: device.clone(),
        }
    }

    /// Grid from the fixed sample noise, named after the epoch and iteration.
    pub fn training_grid<G: Synthesizer<B>>(
        &self,
        generator: &G,
        epoch: usize,
        idx: usize,
    ) -> Result<PathBuf> {
        let path = self.sample_dir.join(format!(
            "{MODEL_NAME}_train_{epoch:02}_{:05}.png",
            idx + 1
        ));
        let images = generator.synthesize(self.sample_noise.clone());
        save_grid(images, self.sample_side, self.sample_side, &path)?;
        Ok(path)
    }

    /// Grid from fresh noise, written once per epoch and after training.
    pub fn visualize<G: Synthesizer<B>>(&self, generator: &G, epoch: usize) -> Result<PathBuf> {
        let path = self
            .result_dir
            .join(format!("{MODEL_NAME}_epoch{epoch:03}_visualize.png"));
        self.fresh_grid(generator, &path)?;
        info!("saved visualisation to {}", path.display());
        Ok(path)
    }

    /// `count` independent grids for the test phase.
    pub fn test_images<G: Synthesizer<B>>(&self, generator: &G, count: usize) -> Result<Vec<PathBuf>> {
        (0..count)
            .map(|i| {
                let path = self.result_dir.join(format!("{MODEL_NAME}_test_{i}.png"));
                self.fresh_grid(generator, &path)?;
                Ok(path)
            })
            .collect()
    }

    fn fresh_grid<G: Synthesizer<B>>(&self, generator: &G, path: &std::path::Path) -> Result<()> {
        let side = self.preview_side;
        let noise = Tensor::random(
            [side * side, generator.noise_dim()],
            Distribution::Normal(0.0, 1.0),
            &self.device,
        );
        save_grid(generator.synthesize(noise), side, side, path)
    }
}
