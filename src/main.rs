use anyhow::Context;
use biggan::{
    config::{Args, Phase},
    logging::init_logging,
    model::training,
};
use clap::Parser;
use tracing::info;

#[cfg(feature = "cuda")]
mod backend {
    pub type Inner = burn::backend::Cuda<f32, i32>;

    pub fn device() -> burn::backend::cuda::CudaDevice {
        burn::backend::cuda::CudaDevice::default()
    }
}

#[cfg(not(feature = "cuda"))]
mod backend {
    pub type Inner = burn::backend::NdArray<f32>;

    pub fn device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::default()
    }
}

type MyAutodiffBackend = burn::backend::Autodiff<backend::Inner>;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // Reject bad flags before anything touches the disk or the device.
    let config = args.validate().context("invalid arguments")?;
    init_logging(args.verbose);
    info!("run {}", config.model_dir());

    let device = backend::device();
    match args.phase {
        Phase::Train => training::train::<MyAutodiffBackend>(config, device)?,
        Phase::Test => {
            training::test::<MyAutodiffBackend>(config, device)?;
        }
    }
    Ok(())
}
