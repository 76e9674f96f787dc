pub mod builder;
pub mod capsule;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod decoder;
pub mod layers;
pub mod loss;
pub mod optimizer;
pub mod routing;

pub use builder::ModelBuilder;
pub use checkpoint::Checkpoint;
pub use config::{NetworkConfig, TrainingConfig};
pub use self::core::{CapsNet, CapsOutput, Evaluation, Prediction};
pub use loss::{CapsuleLoss, MarginLoss, Metrics};
pub use optimizer::{Adam, LrScheduler, Optimizer, Sgd};
