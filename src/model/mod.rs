pub mod architecture;
pub mod checkpoint;
pub mod constants;
pub mod data;
pub mod ema;
pub mod loss;
pub mod regularizer;
pub mod sampling;
pub mod training;
