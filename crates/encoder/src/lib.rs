//! A single transformer encoder layer with precision dispatch and optional
//! padding removal.
//!
//! [`EncoderModule::new`] takes the sixteen layer parameters together with an
//! [`EncoderConfig`], validates every tensor against the dtype and device of
//! `q_kernel`, and binds them to the kernel for that precision (`f32` or
//! `f16`). [`EncoderModule::forward`] validates per-call tensors, allocates the
//! output and hands the work to the kernel. [`EncoderModule::get_state`] and
//! [`EncoderModule::from_state`] expose the module as a flat list of
//! seventeen tensors; [`persistence`] stores that list on disk.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use encoder::{EncoderConfig, EncoderModule, WeightName};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = EncoderConfig::new(8, 16, false);
//! let device = Device::Cpu;
//! let weights = WeightName::ALL.map(|name| {
//!     Tensor::zeros(name.expected_shape(config.hidden_dim()), DType::F32, &device)
//! });
//! # let weights = weights.map(|w| w.unwrap());
//! let module = EncoderModule::new(config, weights)?;
//! let input = Tensor::zeros((2, 4, 128), DType::F32, &device)?;
//! let mask = Tensor::ones((2, 4, 4), DType::F32, &device)?;
//! let output = module.forward(&input, &mask, None)?;
//! assert_eq!(output.dims(), &[2, 4, 128]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod kernel;
pub mod module;
pub mod persistence;
pub mod weights;

pub use config::EncoderConfig;
pub use error::{EncoderError, InputArgument, Result};
pub use kernel::{
    EncoderKernel, Float16Kernel, Float32Kernel, KernelError, KernelHandle, KernelInvocation,
    Precision,
};
pub use module::EncoderModule;
pub use persistence::{load_state, save_state, StateManifest};
pub use weights::{WeightName, WeightProperty, WeightSet, WEIGHT_COUNT};
