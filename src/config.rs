//! Command-line surface and its validation into a [`TrainingConfig`].
//!
//! Everything here is checked before a directory, dataset or tensor is
//! created, so a bad flag never leaves half-initialised state on disk.

use std::path::PathBuf;

use burn::optim::AdamConfig;
use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{GanError, Result};
use crate::model::architecture::{ImageSize, ModelConfig};
use crate::model::loss::GanType;
use crate::model::training::TrainingConfig;

/// What the binary should do with the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Phase {
    Train,
    Test,
}

/// BigGAN training in burn.
#[derive(Parser, Debug, Clone)]
#[command(name = "biggan", version, about = "BigGAN training and sampling")]
pub struct Args {
    /// train or test
    #[arg(long, value_enum, default_value_t = Phase::Train)]
    pub phase: Phase,

    /// Number of epochs to run
    #[arg(long, default_value_t = 50, allow_negative_numbers = true)]
    pub epoch: i64,

    /// Number of generator iterations per epoch
    #[arg(long, default_value_t = 10_000, allow_negative_numbers = true)]
    pub iteration: i64,

    /// Batch size
    #[arg(long, default_value_t = 2048, allow_negative_numbers = true)]
    pub batch_size: i64,

    /// Base channel number per layer
    #[arg(long = "ch", default_value_t = 96, allow_negative_numbers = true)]
    pub base_channels: i64,

    /// Iterations between loss reports and sample grids
    #[arg(long, default_value_t = 1000, allow_negative_numbers = true)]
    pub print_freq: i64,

    /// Iterations between checkpoints
    #[arg(long, default_value_t = 1000, allow_negative_numbers = true)]
    pub save_freq: i64,

    /// Learning rate for the generator
    #[arg(long = "g-lr", default_value_t = 0.00005, allow_negative_numbers = true)]
    pub generator_lr: f64,

    /// Learning rate for the discriminator
    #[arg(long = "d-lr", default_value_t = 0.0002, allow_negative_numbers = true)]
    pub discriminator_lr: f64,

    /// beta1 for Adam
    #[arg(long = "beta1", default_value_t = 0.0, allow_negative_numbers = true)]
    pub adam_beta1: f64,

    /// beta2 for Adam
    #[arg(long = "beta2", default_value_t = 0.9, allow_negative_numbers = true)]
    pub adam_beta2: f64,

    /// Moving average decay for the generator parameters
    #[arg(long = "moving-decay", default_value_t = 0.9999, allow_negative_numbers = true)]
    pub moving_average_decay: f64,

    /// Dimension of the noise vector
    #[arg(long = "z-dim", default_value_t = 128, allow_negative_numbers = true)]
    pub noise_dim: i64,

    /// Use spectral normalisation
    #[arg(long = "sn", default_value_t = true, action = ArgAction::Set)]
    pub use_spectral_norm: bool,

    /// gan / lsgan / wgan-gp / wgan-lp / dragan / hinge
    #[arg(long, default_value = "hinge")]
    pub gan_type: String,

    /// Gradient penalty lambda
    #[arg(long = "ld", default_value_t = 10.0, allow_negative_numbers = true)]
    pub gradient_penalty_lambda: f64,

    /// Discriminator updates per generator update
    #[arg(long, default_value_t = 2, allow_negative_numbers = true)]
    pub n_critic: i64,

    /// Image resolution: 128, 256 or 512
    #[arg(long = "img-size", default_value_t = 512)]
    pub image_size: u32,

    /// Number of images in a training sample grid
    #[arg(long = "sample-num", default_value_t = 64, allow_negative_numbers = true)]
    pub sample_count: i64,

    /// Number of images produced by the test phase
    #[arg(long = "test-num", default_value_t = 10, allow_negative_numbers = true)]
    pub test_count: i64,

    /// Orthogonal regularisation scale, 0 disables it
    #[arg(long = "ortho-scale", default_value_t = 1e-4, allow_negative_numbers = true)]
    pub orthogonal_scale: f64,

    /// Image channels (1 or 3)
    #[arg(long, default_value_t = 3)]
    pub channels: usize,

    /// Folder of training images
    #[arg(long, default_value = "dataset/train")]
    pub dataset: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Worker threads decoding training images
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    /// How many checkpoints to keep on disk
    #[arg(long, default_value_t = 5)]
    pub keep_checkpoints: usize,

    /// Start from scratch when the latest checkpoint cannot be read
    #[arg(long, default_value_t = false)]
    pub fresh_on_corrupt: bool,

    #[arg(long, default_value = "checkpoint")]
    pub checkpoint_dir: PathBuf,

    #[arg(long, default_value = "results")]
    pub result_dir: PathBuf,

    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    #[arg(long, default_value = "samples")]
    pub sample_dir: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Check every option and build the training configuration.
    pub fn validate(&self) -> Result<TrainingConfig> {
        let gan_type: GanType = self.gan_type.parse()?;
        let image_size = ImageSize::try_from(self.image_size)?;

        let epoch = at_least_one("epoch", self.epoch)?;
        let iteration = at_least_one("iteration", self.iteration)?;
        let batch_size = at_least_one("batch_size", self.batch_size)?;
        let base_channels = at_least_one("ch", self.base_channels)?;
        let print_freq = at_least_one("print_freq", self.print_freq)?;
        let save_freq = at_least_one("save_freq", self.save_freq)?;
        let noise_dim = at_least_one("z_dim", self.noise_dim)?;
        let n_critic = at_least_one("n_critic", self.n_critic)?;
        let sample_count = at_least_one("sample_num", self.sample_count)?;
        if self.test_count < 0 {
            return Err(GanError::configuration(format!(
                "test_num must be non-negative, got {}",
                self.test_count
            )));
        }

        positive("g_lr", self.generator_lr)?;
        positive("d_lr", self.discriminator_lr)?;
        unit_interval_open("beta1", self.adam_beta1)?;
        unit_interval_open("beta2", self.adam_beta2)?;
        if !(0.0..=1.0).contains(&self.moving_average_decay) {
            return Err(GanError::configuration(format!(
                "moving_decay must lie in [0, 1], got {}",
                self.moving_average_decay
            )));
        }
        non_negative("ld", self.gradient_penalty_lambda)?;
        non_negative("ortho_scale", self.orthogonal_scale)?;
        if self.channels != 1 && self.channels != 3 {
            return Err(GanError::configuration(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.num_workers == 0 {
            return Err(GanError::configuration("num_workers must be at least one"));
        }
        if self.keep_checkpoints == 0 {
            return Err(GanError::configuration(
                "keep_checkpoints must be at least one",
            ));
        }

        let model = ModelConfig::new(image_size)
            .with_base_channels(base_channels)
            .with_noise_dim(noise_dim)
            .with_channels(self.channels)
            .with_spectral_norm(self.use_spectral_norm);

        let adam = AdamConfig::new()
            .with_beta_1(self.adam_beta1 as f32)
            .with_beta_2(self.adam_beta2 as f32)
            .with_epsilon(1e-8);

        Ok(TrainingConfig::new(
            model,
            adam.clone(),
            adam,
            path_string(&self.checkpoint_dir),
            path_string(&self.result_dir),
            path_string(&self.log_dir),
            path_string(&self.sample_dir),
            path_string(&self.dataset),
        )
        .with_gan_type(gan_type)
        .with_epoch(epoch)
        .with_iteration(iteration)
        .with_batch_size(batch_size)
        .with_print_freq(print_freq)
        .with_save_freq(save_freq)
        .with_generator_lr(self.generator_lr)
        .with_discriminator_lr(self.discriminator_lr)
        .with_moving_average_decay(self.moving_average_decay)
        .with_gradient_penalty_lambda(self.gradient_penalty_lambda)
        .with_orthogonal_scale(self.orthogonal_scale)
        .with_n_critic(n_critic)
        .with_sample_count(sample_count)
        .with_test_count(self.test_count as usize)
        .with_seed(self.seed)
        .with_num_workers(self.num_workers)
        .with_keep_checkpoints(self.keep_checkpoints)
        .with_fresh_on_corrupt(self.fresh_on_corrupt))
    }
}

fn at_least_one(name: &str, value: i64) -> Result<usize> {
    if value < 1 {
        return Err(GanError::configuration(format!(
            "{name} must be larger than or equal to one, got {value}"
        )));
    }
    Ok(value as usize)
}

fn positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(GanError::configuration(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(GanError::configuration(format!(
            "{name} must be non-negative, got {value}"
        )));
    }
    Ok(())
}

fn unit_interval_open(name: &str, value: f64) -> Result<()> {
    if !(0.0..1.0).contains(&value) {
        return Err(GanError::configuration(format!(
            "{name} must lie in [0, 1), got {value}"
        )));
    }
    Ok(())
}

fn path_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["biggan"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn defaults_match_cli_help() {
        let config = parse(&[]).validate().unwrap();
        assert_eq!(config.gan_type, GanType::Hinge);
        assert_eq!(config.model.image_size, ImageSize::X512);
        assert_eq!(config.model.base_channels, 96);
        assert_eq!(config.model.noise_dim, 128);
        assert!(config.model.spectral_norm);
        assert_eq!(config.n_critic, 2);
        assert_eq!(config.batch_size, 2048);
        assert_eq!(config.total_iterations(), 50 * 10_000);
    }

    #[test]
    fn unknown_gan_type_is_rejected() {
        assert!(matches!(parse(&["--gan-type", "wgan"]).validate(), Err(GanError::Configuration(_))));
    }

    #[test]
    fn negative_epoch_fails_hard() {
        assert!(matches!(parse(&["--epoch", "-1"]).validate(), Err(GanError::Configuration(_))));
    }

    #[test]
    fn zero_batch_size_fails_hard() {
        assert!(matches!(parse(&["--batch-size", "0"]).validate(), Err(GanError::Configuration(_))));
    }

    #[test]
    fn unsupported_resolution_is_rejected() {
        assert!(matches!(parse(&["--img-size", "64"]).validate(), Err(GanError::Configuration(_))));
    }

    #[test]
    fn decay_outside_unit_interval_is_rejected() {
        assert!(matches!(parse(&["--moving-decay", "1.5"]).validate(), Err(GanError::Configuration(_))));
    }

    #[test]
    fn zero_workers_are_rejected() {
        assert!(matches!(
            parse(&["--num-workers", "0"]).validate(),
            Err(GanError::Configuration(_))
        ));
    }

    #[test]
    fn spectral_norm_can_be_switched_off() {
        let config = parse(&["--sn", "false", "--gan-type", "wgan-gp"])
            .validate()
            .unwrap();
        assert!(!config.model.spectral_norm);
        assert_eq!(config.gan_type, GanType::WganGp);
    }
}
