/// Prefix used for sample, visualisation and test image names.
pub const MODEL_NAME: &str = "BigGAN";

/// Spatial size of the first generator feature map and the last discriminator one.
pub const BASE_RESOLUTION: usize = 4;

/// Standard deviation of the normal weight initialiser.
pub const INIT_STD: f64 = 0.02;

/// Power-iteration steps used to estimate a kernel's largest singular value.
pub const POWER_ITERATIONS: usize = 3;

/// Step of the central difference along the input-gradient direction.
pub const FINITE_DIFFERENCE_STEP: f64 = 1e-3;
