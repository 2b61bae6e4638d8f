//! Adversarial loss family and gradient penalties.

use std::fmt;
use std::str::FromStr;

use burn::{
    prelude::*,
    tensor::{Distribution, backend::AutodiffBackend},
};
use serde::{Deserialize, Serialize};

use crate::error::GanError;
use crate::model::architecture::Critic;
use crate::model::constants::FINITE_DIFFERENCE_STEP;

/// Supported GAN objectives. Closed set; anything else is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GanType {
    Gan,
    Lsgan,
    WganGp,
    WganLp,
    Dragan,
    Hinge,
}

/// Endpoints the penalty interpolates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Real images and generated images.
    RealFake,
    /// Real images and a noisy copy of themselves.
    RealPerturbed,
}

/// Shape of the penalty applied to the input-gradient norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    /// `(‖g‖ - 1)²`
    TwoSided,
    /// `max(0, ‖g‖ - 1)²`
    OneSided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientPenalty {
    pub interpolation: Interpolation,
    pub kind: PenaltyKind,
}

impl GanType {
    pub const ALL: [GanType; 6] = [
        GanType::Gan,
        GanType::Lsgan,
        GanType::WganGp,
        GanType::WganLp,
        GanType::Dragan,
        GanType::Hinge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GanType::Gan => "gan",
            GanType::Lsgan => "lsgan",
            GanType::WganGp => "wgan-gp",
            GanType::WganLp => "wgan-lp",
            GanType::Dragan => "dragan",
            GanType::Hinge => "hinge",
        }
    }

    /// Gradient penalty attached to the discriminator loss, if any.
    pub fn gradient_penalty(&self) -> Option<GradientPenalty> {
        match self {
            GanType::WganGp => Some(GradientPenalty {
                interpolation: Interpolation::RealFake,
                kind: PenaltyKind::TwoSided,
            }),
            GanType::WganLp => Some(GradientPenalty {
                interpolation: Interpolation::RealFake,
                kind: PenaltyKind::OneSided,
            }),
            GanType::Dragan => Some(GradientPenalty {
                interpolation: Interpolation::RealPerturbed,
                kind: PenaltyKind::TwoSided,
            }),
            GanType::Gan | GanType::Lsgan | GanType::Hinge => None,
        }
    }
}

impl FromStr for GanType {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GanType::ALL
            .into_iter()
            .find(|gan_type| gan_type.as_str() == s)
            .ok_or_else(|| {
                GanError::configuration(format!(
                    "unknown gan_type '{s}', expected one of gan, lsgan, wgan-gp, wgan-lp, dragan, hinge"
                ))
            })
    }
}

impl fmt::Display for GanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generator and discriminator loss for one step.
#[derive(Debug, Clone)]
pub struct LossValue<B: Backend> {
    pub generator: Tensor<B, 1>,
    pub discriminator: Tensor<B, 1>,
}

/// A configured loss: objective plus gradient-penalty weight.
#[derive(Debug, Clone, Copy)]
pub struct GanLoss {
    pub gan_type: GanType,
    pub gp_lambda: f64,
}

impl GanLoss {
    pub fn new(gan_type: GanType, gp_lambda: f64) -> Self {
        Self {
            gan_type,
            gp_lambda,
        }
    }

    /// Full discriminator loss: adversarial term plus gradient penalty when the
    /// objective carries one. Scores are `[N, 1]`, images `[N, C, H, W]`.
    pub fn discriminator_loss<B: AutodiffBackend, C: Critic<B>>(
        &self,
        critic: &C,
        real_scores: Tensor<B, 2>,
        fake_scores: Tensor<B, 2>,
        real_images: Tensor<B, 4>,
        fake_images: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let adversarial = discriminator_adversarial(self.gan_type, real_scores, fake_scores);
        match self.gan_type.gradient_penalty() {
            Some(penalty) => {
                adversarial
                    + gradient_penalty(critic, penalty, real_images, fake_images, self.gp_lambda)
            }
            None => adversarial,
        }
    }

    pub fn generator_loss<B: Backend>(&self, fake_scores: Tensor<B, 2>) -> Tensor<B, 1> {
        generator_adversarial(self.gan_type, fake_scores)
    }
}

/// Both losses at once. The critic plays the role of the scoring function
/// evaluated on interpolated inputs for the gradient penalty.
pub fn compute_losses<B: AutodiffBackend, C: Critic<B>>(
    gan_type: GanType,
    critic: &C,
    real_scores: Tensor<B, 2>,
    fake_scores: Tensor<B, 2>,
    real_images: Tensor<B, 4>,
    fake_images: Tensor<B, 4>,
    gp_lambda: f64,
) -> LossValue<B> {
    let loss = GanLoss::new(gan_type, gp_lambda);
    LossValue {
        generator: loss.generator_loss(fake_scores.clone()),
        discriminator: loss.discriminator_loss(
            critic,
            real_scores,
            fake_scores,
            real_images,
            fake_images,
        ),
    }
}

pub fn discriminator_adversarial<B: Backend>(
    gan_type: GanType,
    real: Tensor<B, 2>,
    fake: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match gan_type {
        // -log σ(x) = softplus(-x), -log(1 - σ(x)) = softplus(x)
        GanType::Gan => softplus(real.neg()).mean() + softplus(fake).mean(),
        GanType::Lsgan => real.sub_scalar(1.0).powf_scalar(2.0).mean() + fake.powf_scalar(2.0).mean(),
        GanType::Hinge => {
            real.neg().add_scalar(1.0).clamp_min(0.0).mean()
                + fake.add_scalar(1.0).clamp_min(0.0).mean()
        }
        GanType::WganGp | GanType::WganLp | GanType::Dragan => fake.mean() - real.mean(),
    }
}

pub fn generator_adversarial<B: Backend>(gan_type: GanType, fake: Tensor<B, 2>) -> Tensor<B, 1> {
    match gan_type {
        GanType::Gan => softplus(fake.neg()).mean(),
        GanType::Lsgan => fake.sub_scalar(1.0).powf_scalar(2.0).mean(),
        GanType::Hinge | GanType::WganGp | GanType::WganLp | GanType::Dragan => fake.mean().neg(),
    }
}

/// `log(1 + exp(x))` without overflow for large `x`.
fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
}

/// Gradient penalty `lambda * mean(f(‖∇D(x̂)‖))` over interpolated inputs.
///
/// burn only differentiates once, so the penalty value uses the exact norm
/// while its parameter gradient is that of a directional difference with
/// the direction held fixed. See [`input_gradient_norm`].
pub fn gradient_penalty<B: AutodiffBackend, C: Critic<B>>(
    critic: &C,
    penalty: GradientPenalty,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    lambda: f64,
) -> Tensor<B, 1> {
    let real = real.detach();
    let device = real.device();
    let [batch, _, _, _] = real.dims();

    let target = match penalty.interpolation {
        Interpolation::RealFake => fake.detach(),
        Interpolation::RealPerturbed => perturb(real.clone()),
    };
    let alpha = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Uniform(0.0, 1.0), &device);
    let interpolated = real.clone() + (target - real) * alpha;

    let excess = input_gradient_norm(critic, interpolated).sub_scalar(1.0);
    let excess = match penalty.kind {
        PenaltyKind::TwoSided => excess,
        PenaltyKind::OneSided => excess.clamp_min(0.0),
    };
    excess.powf_scalar(2.0).mean().mul_scalar(lambda)
}

/// Per-example `‖∇ₓ D(x)‖` as a `[N]` tensor differentiable w.r.t. the critic.
///
/// The value is the exact norm from a backward pass over the inputs. Its
/// gradient comes from a central difference of the critic along the unit
/// input-gradient direction.
pub fn input_gradient_norm<B: AutodiffBackend, C: Critic<B>>(
    critic: &C,
    inputs: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let inputs = inputs.detach();
    let [batch, _, _, _] = inputs.dims();

    let probe = inputs.clone().require_grad();
    let grads = critic.critique(probe.clone()).sum().backward();
    let Some(gradient) = probe.grad(&grads) else {
        return Tensor::zeros([batch], &inputs.device());
    };
    let exact = per_example_norm(gradient.clone());
    let direction = gradient / exact.clone().add_scalar(1e-12).reshape([batch, 1, 1, 1]);
    let direction = Tensor::<B, 4>::from_inner(direction).mul_scalar(FINITE_DIFFERENCE_STEP);

    let ahead = critic.critique(inputs.clone() + direction.clone());
    let behind = critic.critique(inputs - direction);
    let slope = (ahead - behind)
        .div_scalar(2.0 * FINITE_DIFFERENCE_STEP)
        .reshape([batch]);
    Tensor::from_inner(exact) + (slope.clone() - slope.detach())
}

fn per_example_norm<B: Backend>(gradient: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, _, _, _] = gradient.dims();
    gradient
        .flatten::<2>(1, 3)
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .reshape([batch])
}

/// `real + 0.5 * std(real) * N(0, 1)`
fn perturb<B: Backend>(real: Tensor<B, 4>) -> Tensor<B, 4> {
    let flat = real.clone().flatten::<1>(0, 3);
    let mean = flat.clone().mean();
    let std = (flat - mean).powf_scalar(2.0).mean().sqrt();
    let noise = Tensor::<B, 4>::random(real.dims(), Distribution::Normal(0.0, 1.0), &real.device());
    real + noise * std.mul_scalar(0.5).reshape([1, 1, 1, 1])
}
