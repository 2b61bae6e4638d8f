use burn::{
    module::Param,
    nn::{BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, Relu, Tanh},
    prelude::*,
    tensor::{
        Distribution,
        module::{conv_transpose2d, conv2d},
        ops::{ConvOptions, ConvTransposeOptions},
    },
};
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result as GanResult};
use crate::model::constants::{BASE_RESOLUTION, INIT_STD, POWER_ITERATIONS};
use crate::model::regularizer::orthogonal_penalty;

/// Output resolution. Each one selects a fixed generator/discriminator depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSize {
    X128,
    X256,
    X512,
}

impl ImageSize {
    pub fn pixels(&self) -> usize {
        match self {
            ImageSize::X128 => 128,
            ImageSize::X256 => 256,
            ImageSize::X512 => 512,
        }
    }

    /// Channel multipliers from the 4x4 stage up to full resolution.
    fn channel_multipliers(&self) -> &'static [usize] {
        match self {
            ImageSize::X128 => &[16, 16, 8, 4, 2, 1],
            ImageSize::X256 => &[16, 16, 8, 8, 4, 2, 1],
            ImageSize::X512 => &[16, 16, 8, 8, 4, 2, 1, 1],
        }
    }
}

impl TryFrom<u32> for ImageSize {
    type Error = GanError;

    fn try_from(value: u32) -> GanResult<Self> {
        match value {
            128 => Ok(ImageSize::X128),
            256 => Ok(ImageSize::X256),
            512 => Ok(ImageSize::X512),
            other => Err(GanError::configuration(format!(
                "img_size must be one of 128, 256, 512; got {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pixels())
    }
}

/// Anything that turns noise into a batch of images `[N, C, H, W]`.
pub trait Synthesizer<B: Backend> {
    fn noise_dim(&self) -> usize;
    fn synthesize(&self, noise: Tensor<B, 2>) -> Tensor<B, 4>;
}

/// Anything that scores a batch of images, one score per example (`[N, 1]`).
pub trait Critic<B: Backend> {
    fn critique(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Networks whose conv/dense kernels take part in orthogonal regularisation.
pub trait OrthogonalWeights<B: Backend> {
    /// Sum of [`orthogonal_penalty`] over every kernel of the network.
    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1>;
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub image_size: ImageSize,
    #[config(default = 96)]
    pub base_channels: usize,
    #[config(default = 128)]
    pub noise_dim: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = true)]
    pub spectral_norm: bool,
    #[config(default = "0.2")]
    pub leaky_relu_slope: f64,
}

impl ModelConfig {
    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let multipliers = self.image_size.channel_multipliers();
        let widths: Vec<usize> = multipliers.iter().map(|m| m * self.base_channels).collect();
        let base = widths[0];
        let sn = self.spectral_norm;

        let blocks = widths
            .windows(2)
            .map(|pair| UpBlock {
                norm: BatchNormConfig::new(pair[0]).init(device),
                conv: TransposedConv::new(pair[0], pair[1], 3, 2, 1, 1, sn, device),
                activation: Relu::new(),
            })
            .collect();

        let last = widths[widths.len() - 1];
        Generator {
            project: Dense::new(
                self.noise_dim,
                base * BASE_RESOLUTION * BASE_RESOLUTION,
                sn,
                device,
            ),
            blocks,
            out_norm: BatchNormConfig::new(last).init(device),
            to_image: Conv::new(last, self.channels, 3, 1, 1, sn, device),
            activation: Relu::new(),
            output: Tanh::new(),
            base,
            noise_dim: self.noise_dim,
        }
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let widths: Vec<usize> = self
            .image_size
            .channel_multipliers()
            .iter()
            .rev()
            .map(|m| m * self.base_channels)
            .collect();
        let sn = self.spectral_norm;

        let blocks = widths
            .windows(2)
            .map(|pair| Conv::new(pair[0], pair[1], 4, 2, 1, sn, device))
            .collect();

        let top = widths[widths.len() - 1];
        Discriminator {
            stem: Conv::new(self.channels, widths[0], 3, 1, 1, sn, device),
            blocks,
            head: Dense::new(top * BASE_RESOLUTION * BASE_RESOLUTION, 1, sn, device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(self.leaky_relu_slope)
                .init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    project: Dense<B>,
    blocks: Vec<UpBlock<B>>,
    out_norm: BatchNorm<B, 2>,
    to_image: Conv<B>,
    activation: Relu,
    output: Tanh,
    base: usize,
    noise_dim: usize,
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    norm: BatchNorm<B, 2>,
    conv: TransposedConv<B>,
    activation: Relu,
}

#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    stem: Conv<B>,
    blocks: Vec<Conv<B>>,
    head: Dense<B>,
    activation: LeakyRelu,
}

impl<B: Backend> Generator<B> {
    pub fn forward(&self, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = noise.dims();
        let x = self.project.forward(noise);
        let mut x = x.reshape([batch, self.base, BASE_RESOLUTION, BASE_RESOLUTION]);
        for block in &self.blocks {
            x = block.norm.forward(x);
            x = block.activation.forward(x);
            x = block.conv.forward(x);
        }
        x = self.out_norm.forward(x);
        x = self.activation.forward(x);
        x = self.to_image.forward(x);
        self.output.forward(x)
    }
}

impl<B: Backend> Discriminator<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for conv in &self.blocks {
            x = self.activation.forward(x);
            x = conv.forward(x);
        }
        x = self.activation.forward(x);
        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);
        self.head.forward(x)
    }
}

impl<B: Backend> Synthesizer<B> for Generator<B> {
    fn noise_dim(&self) -> usize {
        self.noise_dim
    }

    fn synthesize(&self, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        self.forward(noise)
    }
}

impl<B: Backend> Critic<B> for Discriminator<B> {
    fn critique(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

impl<B: Backend> OrthogonalWeights<B> for Generator<B> {
    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1> {
        self.blocks.iter().fold(
            self.project.orthogonal_penalty(scale) + self.to_image.orthogonal_penalty(scale),
            |total, block| total + block.conv.orthogonal_penalty(scale),
        )
    }
}

impl<B: Backend> OrthogonalWeights<B> for Discriminator<B> {
    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1> {
        self.blocks.iter().fold(
            self.stem.orthogonal_penalty(scale) + self.head.orthogonal_penalty(scale),
            |total, conv| total + conv.orthogonal_penalty(scale),
        )
    }
}

/// Convolution, weight `[out, in, k, k]`.
#[derive(Module, Debug)]
pub struct Conv<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    stride: usize,
    padding: usize,
    spectral_norm: bool,
}

/// Transposed convolution, weight `[in, out, k, k]`.
#[derive(Module, Debug)]
pub struct TransposedConv<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    stride: usize,
    padding: usize,
    padding_out: usize,
    spectral_norm: bool,
}

/// Fully connected layer, weight `[in, out]`.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
    spectral_norm: bool,
}

impl<B: Backend> Conv<B> {
    fn new(
        channels_in: usize,
        channels_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        spectral_norm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            weight: init_weight([channels_out, channels_in, kernel, kernel], device),
            bias: Param::from_tensor(Tensor::zeros([channels_out], device)),
            stride,
            padding,
            spectral_norm,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        conv2d(
            x,
            kernel(self.weight.val(), self.spectral_norm),
            Some(self.bias.val()),
            ConvOptions::new(
                [self.stride, self.stride],
                [self.padding, self.padding],
                [1, 1],
                1,
            ),
        )
    }

    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1> {
        // [out, in, kh, kw] -> [kh, kw, in, out]
        orthogonal_penalty(self.weight.val().permute([2, 3, 1, 0]), scale)
    }
}

impl<B: Backend> TransposedConv<B> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        channels_in: usize,
        channels_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        padding_out: usize,
        spectral_norm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            weight: init_weight([channels_in, channels_out, kernel, kernel], device),
            bias: Param::from_tensor(Tensor::zeros([channels_out], device)),
            stride,
            padding,
            padding_out,
            spectral_norm,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        conv_transpose2d(
            x,
            kernel(self.weight.val(), self.spectral_norm),
            Some(self.bias.val()),
            ConvTransposeOptions::new(
                [self.stride, self.stride],
                [self.padding, self.padding],
                [self.padding_out, self.padding_out],
                [1, 1],
                1,
            ),
        )
    }

    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1> {
        // [in, out, kh, kw] -> [kh, kw, out, in], the transposed-kernel order
        orthogonal_penalty(self.weight.val().permute([2, 3, 1, 0]), scale)
    }
}

impl<B: Backend> Dense<B> {
    fn new(d_input: usize, d_output: usize, spectral_norm: bool, device: &B::Device) -> Self {
        Self {
            weight: init_weight([d_input, d_output], device),
            bias: Param::from_tensor(Tensor::zeros([d_output], device)),
            spectral_norm,
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let weight = kernel(self.weight.val(), self.spectral_norm);
        x.matmul(weight) + self.bias.val().unsqueeze()
    }

    fn orthogonal_penalty(&self, scale: f64) -> Tensor<B, 1> {
        orthogonal_penalty(self.weight.val(), scale)
    }
}

fn init_weight<B: Backend, const D: usize>(
    shape: [usize; D],
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    Param::from_tensor(Tensor::random(
        shape,
        Distribution::Normal(0.0, INIT_STD),
        device,
    ))
}

fn kernel<B: Backend, const D: usize>(weight: Tensor<B, D>, spectral_norm: bool) -> Tensor<B, D> {
    if spectral_norm {
        spectral_normalize(weight, POWER_ITERATIONS)
    } else {
        weight
    }
}

/// Divide `weight` by its largest singular value.
///
/// The weight is viewed as a `[dims[0], rest]` matrix. Power iteration starts
/// from a uniform right vector and runs on a detached copy, so the singular vectors
/// act as constants and the gradient only flows through `sigma = uᵀ W v`.
pub fn spectral_normalize<B: Backend, const D: usize>(
    weight: Tensor<B, D>,
    iterations: usize,
) -> Tensor<B, D> {
    let device = weight.device();
    let rows = weight.dims()[0];
    let cols = weight.shape().num_elements() / rows;
    let matrix = weight.clone().reshape([rows, cols]);
    let frozen = matrix.clone().detach();

    let mut v = Tensor::<B, 2>::ones([cols, 1], &device).div_scalar((cols as f64).sqrt());
    let mut u = normalize_column(frozen.clone().matmul(v.clone()));
    for _ in 1..iterations {
        v = normalize_column(frozen.clone().transpose().matmul(u));
        u = normalize_column(frozen.clone().matmul(v.clone()));
    }

    let sigma = u.transpose().matmul(matrix.matmul(v)).add_scalar(1e-12);
    weight / sigma.reshape([1usize; D])
}

fn normalize_column<B: Backend>(v: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = v.clone().powf_scalar(2.0).sum().sqrt().add_scalar(1e-12);
    v / norm.reshape([1, 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn small(size: ImageSize, sn: bool) -> ModelConfig {
        ModelConfig::new(size)
            .with_base_channels(1)
            .with_noise_dim(8)
            .with_spectral_norm(sn)
    }

    #[test]
    fn generator_produces_full_resolution_images() {
        let device = Default::default();
        let generator = small(ImageSize::X128, true).init_generator::<TestBackend>(&device);
        let noise = Tensor::random([2, 8], Distribution::Normal(0.0, 1.0), &device);
        let images = generator.forward(noise);
        assert_eq!(images.dims(), [2, 3, 128, 128]);

        let max: f32 = images.abs().max().into_scalar().elem();
        assert!(max <= 1.0);
    }

    #[test]
    fn discriminator_scores_each_example() {
        let device = Default::default();
        let discriminator = small(ImageSize::X128, false).init_discriminator::<TestBackend>(&device);
        let images = Tensor::random([3, 3, 128, 128], Distribution::Uniform(-1.0, 1.0), &device);
        assert_eq!(discriminator.forward(images).dims(), [3, 1]);
    }

    #[test]
    fn depth_follows_resolution() {
        let device = Default::default();
        for (size, blocks) in [(ImageSize::X128, 5), (ImageSize::X256, 6), (ImageSize::X512, 7)] {
            let generator = small(size, false).init_generator::<TestBackend>(&device);
            assert_eq!(generator.blocks.len(), blocks);
            let discriminator = small(size, false).init_discriminator::<TestBackend>(&device);
            assert_eq!(discriminator.blocks.len(), blocks);
        }
    }

    #[test]
    fn spectral_normalized_weight_has_unit_norm() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[3.0, 0.0], [0.0, 1.0]], &device);
        let normalized = spectral_normalize(weight, 20);
        let values = normalized.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-3);
        assert!((values[3] - 1.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn orthogonal_penalty_covers_every_kernel() {
        let device = Default::default();
        let discriminator = small(ImageSize::X128, true).init_discriminator::<TestBackend>(&device);
        let penalty: f32 = discriminator.orthogonal_penalty(1e-4).into_scalar().elem();
        assert!(penalty.is_finite());
        assert!(penalty > 0.0);
    }

    #[test]
    fn image_size_rejects_unsupported_resolutions() {
        assert!(ImageSize::try_from(64).is_err());
        assert_eq!(ImageSize::try_from(256).unwrap(), ImageSize::X256);
    }
}
