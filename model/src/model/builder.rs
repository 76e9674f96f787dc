use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{NetworkConfig, TrainingConfig},
    core::CapsNet,
    decoder::Decoder,
    layers::Conv2d,
};
use crate::error::{CapsError, Result};

/// Model builder
#[derive(Default)]
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    training_config: Option<TrainingConfig>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training_config = Some(config);
        self
    }

    /// Overrides the seed of the training configuration.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates both configurations and initialises every weight from a
    /// seeded generator, so equal seeds build identical networks.
    pub fn build(self) -> Result<CapsNet> {
        let network_config = self.network_config.unwrap_or_default();
        let mut training_config = self.training_config.unwrap_or_default();
        if let Some(seed) = self.seed {
            training_config.seed = seed;
        }

        network_config.validate()?;
        training_config.validate()?;

        let mut rng = StdRng::seed_from_u64(training_config.seed);
        let (in_channels, _, _) = network_config.input_shape;
        let conv = &network_config.conv;
        let conv1 = Conv2d::new(
            in_channels,
            conv.out_channels,
            conv.kernel_size,
            conv.stride,
            conv.padding,
            conv.activation,
            &mut rng,
        );

        let p = &network_config.primary;
        let primary = PrimaryCapsLayer::new(
            conv.out_channels,
            p.num_capsules,
            p.capsule_dim,
            p.kernel_size,
            p.stride,
            p.padding,
            &mut rng,
        );

        let input_capsules = network_config
            .num_primary_capsules()
            .ok_or_else(|| CapsError::invalid_config("primary capsule grid is empty"))?;
        let digit = DigitCapsLayer::new(
            input_capsules,
            p.capsule_dim,
            network_config.digit.num_capsules,
            network_config.digit.capsule_dim,
            network_config.routing_iterations,
            &mut rng,
        );

        let decoder = network_config.decoder.as_ref().map(|d| {
            Decoder::new(
                network_config.digit.num_capsules,
                network_config.digit.capsule_dim,
                &d.hidden_sizes,
                network_config.input_size(),
                &mut rng,
            )
        });

        debug!(
            input_capsules,
            seed = training_config.seed,
            "built capsule network"
        );

        Ok(CapsNet::new(
            network_config,
            training_config,
            conv1,
            primary,
            digit,
            decoder,
            rng,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_build_is_paper_model() {
        let model = ModelBuilder::new().build().unwrap();
        assert_eq!(model.digit.weights.dim(), (1152, 10, 16, 8));
        assert_eq!(model.conv1.out_channels(), 256);
        assert!(model.decoder.is_some());
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = ModelBuilder::new()
            .with_network_config(NetworkConfig::compact())
            .with_seed(11)
            .build()
            .unwrap();
        let b = ModelBuilder::new()
            .with_network_config(NetworkConfig::compact())
            .with_seed(11)
            .build()
            .unwrap();
        let c = ModelBuilder::new()
            .with_network_config(NetworkConfig::compact())
            .with_seed(12)
            .build()
            .unwrap();

        assert_eq!(a.digit.weights, b.digit.weights);
        assert_eq!(a.conv1.weights, b.conv1.weights);
        assert_ne!(a.conv1.weights, c.conv1.weights);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = NetworkConfig::compact();
        config.routing_iterations = 0;
        assert!(ModelBuilder::new().with_network_config(config).build().is_err());

        let mut training = TrainingConfig::default();
        training.batch_size = 0;
        assert!(ModelBuilder::new()
            .with_network_config(NetworkConfig::compact())
            .with_training_config(training)
            .build()
            .is_err());
    }
}
