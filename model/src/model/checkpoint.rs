//! Gzip-compressed JSON checkpoints.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::builder::ModelBuilder;
use super::config::{NetworkConfig, TrainingConfig};
use super::core::{CapsNet, TrainingHistory};
use crate::error::{CapsError, Result};

/// Everything needed to rebuild a trained network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub network_config: NetworkConfig,
    pub parameters: BTreeMap<String, ArrayD<f32>>,
    pub epoch: usize,
    pub history: TrainingHistory,
}

impl Checkpoint {
    pub fn from_model(model: &mut CapsNet) -> Self {
        let parameters = model
            .parameters()
            .into_iter()
            .map(|p| (p.name, p.value.to_owned()))
            .collect();

        Self {
            network_config: model.network_config.clone(),
            parameters,
            epoch: model.state.current_epoch,
            history: model.history.clone(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        encoder.finish()?;
        debug!(path = %path.as_ref().display(), tensors = self.parameters.len(), "checkpoint written");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let decoder = GzDecoder::new(BufReader::new(file));
        Ok(serde_json::from_reader(decoder)?)
    }

    /// Copies the stored tensors into `model`, which must have the same layout.
    pub fn restore(&self, model: &mut CapsNet) -> Result<()> {
        let params = model.parameters();
        // Check the whole layout before writing anything.
        let mut pairs = Vec::with_capacity(params.len());
        for param in params {
            let stored = self
                .parameters
                .get(&param.name)
                .ok_or_else(|| CapsError::MissingParameter(param.name.clone()))?;
            if stored.shape() != param.value.shape() {
                return Err(CapsError::shape_mismatch(
                    param.name,
                    param.value.shape(),
                    stored.shape(),
                ));
            }
            pairs.push((param.value, stored));
        }
        for (mut value, stored) in pairs {
            value.assign(stored);
        }
        model.history = self.history.clone();
        model.state.current_epoch = self.epoch;
        Ok(())
    }

    /// Rebuilds the stored network and loads its weights.
    pub fn into_model(self, training_config: TrainingConfig) -> Result<CapsNet> {
        let mut model = ModelBuilder::new()
            .with_network_config(self.network_config.clone())
            .with_training_config(training_config)
            .build()?;
        self.restore(&mut model)?;
        model.state.is_trained = true;
        Ok(model)
    }
}

impl CapsNet {
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        Checkpoint::from_model(self).save(path)
    }

    pub fn load(path: impl AsRef<Path>, training_config: TrainingConfig) -> Result<CapsNet> {
        Checkpoint::load(path)?.into_model(training_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{
        Activation, ConvConfig, DecoderConfig, DigitCapsConfig, PrimaryCapsConfig,
    };
    use ndarray::Array4;
    use tempfile::tempdir;

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            input_shape: (1, 10, 10),
            conv: ConvConfig {
                out_channels: 3,
                kernel_size: 3,
                stride: 1,
                padding: 1,
                activation: Activation::ReLU,
            },
            primary: PrimaryCapsConfig {
                num_capsules: 2,
                capsule_dim: 3,
                kernel_size: 4,
                stride: 3,
                padding: 0,
            },
            digit: DigitCapsConfig {
                num_capsules: 4,
                capsule_dim: 5,
            },
            routing_iterations: 2,
            decoder: Some(DecoderConfig {
                hidden_sizes: vec![8],
            }),
        }
    }

    fn build(seed: u64) -> CapsNet {
        ModelBuilder::new()
            .with_network_config(small_config())
            .with_seed(seed)
            .build()
            .unwrap()
    }

    #[test]
    fn test_save_and_load_restores_predictions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json.gz");

        let mut model = build(1);
        model.history.update(0.5, 0.4, 0.8, 0.85);
        model.save(&path).unwrap();

        let mut loaded = CapsNet::load(&path, TrainingConfig::default()).unwrap();
        assert_eq!(loaded.history.test_accuracy, vec![0.85]);
        for (a, b) in loaded.digit.weights.iter().zip(model.digit.weights.iter()) {
            assert!((a - b).abs() < 1e-7);
        }

        let input = Array4::from_elem((2, 1, 10, 10), 0.3);
        let expected = model.predict(&input.view()).unwrap();
        let predictions = loaded.predict(&input.view()).unwrap();
        for (p, e) in predictions.iter().zip(&expected) {
            for (a, b) in p.lengths.iter().zip(&e.lengths) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_restore_overwrites_weights() {
        let mut source = build(1);
        let mut target = build(2);
        assert_ne!(source.conv1.weights, target.conv1.weights);

        Checkpoint::from_model(&mut source).restore(&mut target).unwrap();
        assert_eq!(source.conv1.weights, target.conv1.weights);
    }

    #[test]
    fn test_missing_parameter() {
        let mut model = build(1);
        let mut checkpoint = Checkpoint::from_model(&mut model);
        checkpoint.parameters.remove("digit.weight");
        assert!(matches!(
            checkpoint.restore(&mut model),
            Err(CapsError::MissingParameter(name)) if name == "digit.weight"
        ));
    }

    #[test]
    fn test_failed_restore_leaves_weights_untouched() {
        let mut source = build(1);
        let mut target = build(2);
        let conv_before = target.conv1.weights.clone();
        let digit_before = target.digit.weights.clone();

        let mut checkpoint = Checkpoint::from_model(&mut source);
        checkpoint.parameters.remove("digit.weight");
        assert!(checkpoint.restore(&mut target).is_err());
        assert_eq!(target.conv1.weights, conv_before);
        assert_eq!(target.digit.weights, digit_before);

        let mut checkpoint = Checkpoint::from_model(&mut source);
        checkpoint
            .parameters
            .insert("conv1.bias".into(), ArrayD::zeros(vec![7]));
        assert!(checkpoint.restore(&mut target).is_err());
        assert_eq!(target.conv1.weights, conv_before);
        assert_eq!(target.digit.weights, digit_before);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut model = build(1);
        let mut checkpoint = Checkpoint::from_model(&mut model);
        checkpoint
            .parameters
            .insert("conv1.bias".into(), ArrayD::zeros(vec![7]));
        assert!(matches!(
            checkpoint.restore(&mut model),
            Err(CapsError::ShapeMismatch { .. })
        ));
    }
}
