//! Capsule network with dynamic routing between capsules, trained on MNIST.
//!
//! Layers implement their own forward and backward passes over `ndarray`
//! tensors; batches are processed in parallel with `rayon`.

pub mod error;
pub mod model;
pub mod train_data;

pub use error::{CapsError, Result};
pub use model::{CapsNet, Checkpoint, ModelBuilder, NetworkConfig, TrainingConfig};
