use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CapsError, Result};

/// Activation applied after a convolution or dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    None,
}

/// Full network topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (channels, height, width)
    pub input_shape: (usize, usize, usize),
    pub conv: ConvConfig,
    pub primary: PrimaryCapsConfig,
    pub digit: DigitCapsConfig,
    pub routing_iterations: usize,
    /// Reconstruction decoder, disabled when `None`
    pub decoder: Option<DecoderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

/// `capsule_dim` parallel convolutions, each producing `num_capsules` channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryCapsConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitCapsConfig {
    /// One capsule per class
    pub num_capsules: usize,
    pub capsule_dim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub hidden_sizes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,
    pub log_interval: usize,
    pub seed: u64,
    pub save_best: bool,
    /// Epochs without test-loss improvement before stopping, 0 disables
    pub early_stopping_patience: usize,
    pub optimizer_type: OptimizerType,
    pub loss_config: LossConfig,
    pub lr_schedule: Option<LrSchedule>,
    /// Random translation in pixels applied to training images
    pub max_shift: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    SGD { momentum: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
    pub reconstruction_weight: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrSchedule {
    StepDecay { step_size: usize, gamma: f32 },
    ReduceOnPlateau { factor: f32, patience: usize },
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if kernel == 0 || stride == 0 || kernel > padded {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl NetworkConfig {
    /// Smaller model that trains in reasonable time on a laptop CPU.
    pub fn compact() -> Self {
        Self {
            input_shape: (1, 28, 28),
            conv: ConvConfig {
                out_channels: 64,
                kernel_size: 9,
                stride: 1,
                padding: 0,
                activation: Activation::ReLU,
            },
            primary: PrimaryCapsConfig {
                num_capsules: 8,
                capsule_dim: 8,
                kernel_size: 9,
                stride: 2,
                padding: 0,
            },
            digit: DigitCapsConfig {
                num_capsules: 10,
                capsule_dim: 16,
            },
            routing_iterations: 3,
            decoder: Some(DecoderConfig {
                hidden_sizes: vec![256, 512],
            }),
        }
    }

    /// (channels, height, width) after the first convolution.
    pub fn conv_output_shape(&self) -> Option<(usize, usize, usize)> {
        let (_, h, w) = self.input_shape;
        let c = &self.conv;
        Some((
            c.out_channels,
            conv_out(h, c.kernel_size, c.stride, c.padding)?,
            conv_out(w, c.kernel_size, c.stride, c.padding)?,
        ))
    }

    /// Spatial grid (height, width) of the primary capsule convolutions.
    pub fn primary_grid(&self) -> Option<(usize, usize)> {
        let (_, h, w) = self.conv_output_shape()?;
        let p = &self.primary;
        Some((
            conv_out(h, p.kernel_size, p.stride, p.padding)?,
            conv_out(w, p.kernel_size, p.stride, p.padding)?,
        ))
    }

    /// Number of primary capsules routed into the digit layer.
    pub fn num_primary_capsules(&self) -> Option<usize> {
        let (h, w) = self.primary_grid()?;
        Some(self.primary.num_capsules * h * w)
    }

    /// Flattened image size, which is also the decoder output size.
    pub fn input_size(&self) -> usize {
        let (c, h, w) = self.input_shape;
        c * h * w
    }

    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.input_shape;
        if c == 0 || h == 0 || w == 0 {
            return Err(CapsError::invalid_config("input shape must be non-zero"));
        }
        if self.conv.out_channels == 0 {
            return Err(CapsError::invalid_config("conv needs at least one output channel"));
        }
        if self.conv_output_shape().is_none() {
            return Err(CapsError::invalid_config(format!(
                "conv kernel {} (stride {}) does not fit a {}x{} input",
                self.conv.kernel_size, self.conv.stride, h, w
            )));
        }
        let p = &self.primary;
        if p.num_capsules == 0 || p.capsule_dim == 0 {
            return Err(CapsError::invalid_config(
                "primary capsules need a non-zero count and dimension",
            ));
        }
        if self.primary_grid().is_none() {
            return Err(CapsError::invalid_config(format!(
                "primary capsule kernel {} (stride {}) does not fit the conv output",
                p.kernel_size, p.stride
            )));
        }
        if self.digit.num_capsules < 2 || self.digit.capsule_dim == 0 {
            return Err(CapsError::invalid_config(
                "digit capsules need at least two classes and a non-zero dimension",
            ));
        }
        if self.routing_iterations == 0 {
            return Err(CapsError::invalid_config("routing needs at least one iteration"));
        }
        if let Some(decoder) = &self.decoder {
            if decoder.hidden_sizes.iter().any(|&s| s == 0) {
                return Err(CapsError::invalid_config("decoder layers must be non-empty"));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(CapsError::invalid_config("batch sizes must be non-zero"));
        }
        if self.num_epochs == 0 {
            return Err(CapsError::invalid_config("at least one epoch is required"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(CapsError::invalid_config("learning rate must be positive"));
        }
        self.loss_config.validate()
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        let LossConfig {
            positive_margin: pos,
            negative_margin: neg,
            down_weighting,
            reconstruction_weight,
        } = *self;
        if !(0.0 <= neg && neg < pos && pos <= 1.0) {
            return Err(CapsError::invalid_config(format!(
                "margins must satisfy 0 <= m- < m+ <= 1, got m-={neg} m+={pos}"
            )));
        }
        if down_weighting < 0.0 || reconstruction_weight < 0.0 {
            return Err(CapsError::invalid_config("loss weights must be non-negative"));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_shape: (1, 28, 28),
            conv: ConvConfig {
                out_channels: 256,
                kernel_size: 9,
                stride: 1,
                padding: 0,
                activation: Activation::ReLU,
            },
            primary: PrimaryCapsConfig {
                num_capsules: 32,
                capsule_dim: 8,
                kernel_size: 9,
                stride: 2,
                padding: 0,
            },
            digit: DigitCapsConfig {
                num_capsules: 10,
                capsule_dim: 16,
            },
            routing_iterations: 3,
            decoder: Some(DecoderConfig {
                hidden_sizes: vec![512, 1024],
            }),
        }
    }
}

impl Default for OptimizerType {
    fn default() -> Self {
        OptimizerType::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            test_batch_size: 1000,
            learning_rate: 0.001,
            num_epochs: 10,
            log_interval: 10,
            seed: 1,
            save_best: true,
            early_stopping_patience: 0,
            optimizer_type: OptimizerType::default(),
            loss_config: LossConfig::default(),
            lr_schedule: None,
            max_shift: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_shapes() {
        let config = NetworkConfig::default();
        assert_eq!(config.conv_output_shape(), Some((256, 20, 20)));
        assert_eq!(config.primary_grid(), Some((6, 6)));
        assert_eq!(config.num_primary_capsules(), Some(1152));
        assert_eq!(config.input_size(), 784);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compact_is_valid() {
        let config = NetworkConfig::compact();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_primary_capsules(), Some(8 * 6 * 6));
    }

    #[test]
    fn test_kernel_too_large() {
        let mut config = NetworkConfig::default();
        config.primary.kernel_size = 21;
        assert!(matches!(config.validate(), Err(CapsError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_routing_iterations() {
        let config = NetworkConfig {
            routing_iterations: 0,
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_margins_must_be_ordered() {
        let training = TrainingConfig {
            loss_config: LossConfig {
                positive_margin: 0.1,
                negative_margin: 0.9,
                ..LossConfig::default()
            },
            ..TrainingConfig::default()
        };
        assert!(training.validate().is_err());
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        let config = NetworkConfig::compact();
        config.to_json_file(&path).unwrap();
        assert_eq!(NetworkConfig::from_json_file(&path).unwrap(), config);
    }
}
