use std::path::Path;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    checkpoint::Checkpoint,
    config::{NetworkConfig, TrainingConfig},
    decoder::Decoder,
    layers::{Conv2d, Parameter, Trainable},
    loss::{capsule_lengths, predicted_classes, CapsuleLoss, LossValue, Metrics},
    optimizer::{LrScheduler, Optimizer},
};
use crate::error::{CapsError, Result};
use crate::train_data::{Augmentation, Batch, Dataset};

/// Capsule network: conv stem, primary capsules, routed digit capsules and
/// an optional reconstruction decoder.
pub struct CapsNet {
    pub network_config: NetworkConfig,
    pub training_config: TrainingConfig,
    pub conv1: Conv2d,
    pub primary: PrimaryCapsLayer,
    pub digit: DigitCapsLayer,
    pub decoder: Option<Decoder>,
    pub loss_fn: CapsuleLoss,
    pub history: TrainingHistory,
    pub state: ModelState,

    rng: StdRng,
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct CapsOutput {
    /// (batch, classes, capsule_dim)
    pub digit_caps: Array3<f32>,
    /// (batch, classes)
    pub lengths: Array2<f32>,
    /// (batch, pixels), present when the network has a decoder
    pub reconstruction: Option<Array2<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchStats {
    pub loss: LossValue,
    pub correct: usize,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f32,
    pub margin: f32,
    pub reconstruction: f32,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: usize,
    /// Capsule length per class
    pub lengths: Vec<f32>,
}

/// One row of [`CapsNet::summary`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSummary {
    pub name: String,
    pub output_shape: Vec<usize>,
    pub parameters: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub test_loss: Vec<f32>,
    pub train_accuracy: Vec<f32>,
    pub test_accuracy: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelState {
    pub is_trained: bool,
    pub best_loss: f32,
    pub best_accuracy: f32,
    pub current_epoch: usize,
    pub early_stopping_counter: usize,
}

fn count_parameters<T: Trainable>(layer: &mut T) -> usize {
    layer.parameters("").iter().map(|p| p.value.len()).sum()
}

impl CapsNet {
    pub(crate) fn new(
        network_config: NetworkConfig,
        training_config: TrainingConfig,
        conv1: Conv2d,
        primary: PrimaryCapsLayer,
        digit: DigitCapsLayer,
        decoder: Option<Decoder>,
        rng: StdRng,
    ) -> Self {
        let loss_fn = CapsuleLoss::new(&training_config.loss_config, decoder.is_some());

        Self {
            network_config,
            training_config,
            conv1,
            primary,
            digit,
            decoder,
            loss_fn,
            history: TrainingHistory::new(),
            state: ModelState::new(),
            rng,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.network_config.digit.num_capsules
    }

    /// Forward pass
    ///
    /// The decoder reconstructs from the capsule of `labels` when given,
    /// otherwise from the longest capsule.
    pub fn forward(&mut self, input: &ArrayView4<f32>, labels: Option<&[usize]>) -> Result<CapsOutput> {
        let (_, c, h, w) = input.dim();
        if (c, h, w) != self.network_config.input_shape {
            return Err(CapsError::shape_mismatch(
                "network input",
                self.network_config.input_shape,
                (c, h, w),
            ));
        }

        let features = self.conv1.forward(input)?;
        let primary = self.primary.forward(&features.view())?;
        let digit_caps = self.digit.forward(&primary.view())?;
        let lengths = capsule_lengths(&digit_caps.view());

        let reconstruction = match self.decoder.as_mut() {
            Some(decoder) => {
                let selected = match labels {
                    Some(labels) => labels.to_vec(),
                    None => predicted_classes(&lengths.view()),
                };
                Some(decoder.forward(&digit_caps.view(), &selected)?)
            }
            None => None,
        };

        Ok(CapsOutput {
            digit_caps,
            lengths,
            reconstruction,
        })
    }

    /// Backward pass: accumulates gradients of the capsule loss in every layer.
    pub fn backward(&mut self, output: &CapsOutput, pixels: &ArrayView2<f32>, labels: &[usize]) -> Result<()> {
        let mut grad_caps = self
            .loss_fn
            .margin_loss
            .gradient(&output.digit_caps.view(), labels);

        if let (Some(decoder), Some(reconstruction), Some(recon_loss)) = (
            self.decoder.as_mut(),
            output.reconstruction.as_ref(),
            self.loss_fn.reconstruction_loss.as_ref(),
        ) {
            let grad_recon = recon_loss.gradient(&reconstruction.view(), pixels);
            grad_caps += &decoder.backward(&grad_recon.view())?;
        }

        let grad_primary = self.digit.backward(&grad_caps.view())?;
        let grad_features = self.primary.backward(&grad_primary.view())?;
        self.conv1.backward(&grad_features.view())?;
        Ok(())
    }

    /// Every learnable tensor, named `conv1.weight`, `digit.weight`, ...
    pub fn parameters(&mut self) -> Vec<Parameter<'_>> {
        let mut params = self.conv1.parameters("conv1");
        params.extend(self.primary.parameters("primary"));
        params.extend(self.digit.parameters("digit"));
        if let Some(decoder) = self.decoder.as_mut() {
            params.extend(decoder.parameters("decoder"));
        }
        params
    }

    pub fn num_parameters(&mut self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }

    pub fn zero_grad(&mut self) {
        self.conv1.zero_grad();
        self.primary.zero_grad();
        self.digit.zero_grad();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.zero_grad();
        }
    }

    /// Applies one optimizer step to every parameter.
    pub fn update_weights(&mut self, optimizer: &mut dyn Optimizer) {
        optimizer.begin_step();
        for param in self.parameters() {
            optimizer.update(&param.name, param.value, param.grad);
        }
    }

    fn check_labels(&self, dataset: &Dataset) -> Result<()> {
        let num_classes = self.num_classes();
        if let Some(&label) = dataset.labels.iter().find(|&&l| l >= num_classes) {
            return Err(CapsError::data(format!(
                "label {label} out of range for {num_classes} classes"
            )));
        }
        let (_, h, w) = self.network_config.input_shape;
        if dataset.image_size() != (h, w) {
            return Err(CapsError::shape_mismatch(
                "dataset images",
                (h, w),
                dataset.image_size(),
            ));
        }
        Ok(())
    }

    /// One optimisation step on a batch.
    pub fn train_batch(&mut self, batch: &Batch, optimizer: &mut dyn Optimizer) -> Result<BatchStats> {
        self.zero_grad();
        let output = self.forward(&batch.inputs.view(), Some(&batch.labels))?;
        let loss = self.loss_fn.compute(
            &output.digit_caps.view(),
            &batch.labels,
            output.reconstruction.as_ref().map(|r| r.view()),
            &batch.pixels.view(),
        );
        if !loss.total.is_finite() {
            warn!("non-finite training loss {}", loss.total);
        }

        self.backward(&output, &batch.pixels.view(), &batch.labels)?;
        self.update_weights(optimizer);

        let correct = predicted_classes(&output.lengths.view())
            .iter()
            .zip(&batch.labels)
            .filter(|(p, t)| p == t)
            .count();

        Ok(BatchStats {
            loss,
            correct,
            size: batch.len(),
        })
    }

    /// Trains for `num_epochs`, evaluating on `test_set` after every epoch.
    ///
    /// When `checkpoint_path` is set the best epoch (or the last one when
    /// `save_best` is off) is written there.
    pub fn train(
        &mut self,
        train_set: &Dataset,
        test_set: &Dataset,
        optimizer: &mut dyn Optimizer,
        mut scheduler: Option<LrScheduler>,
        checkpoint_path: Option<&Path>,
    ) -> Result<()> {
        self.check_labels(train_set)?;
        self.check_labels(test_set)?;
        if train_set.is_empty() {
            return Err(CapsError::data("training set is empty"));
        }

        let num_epochs = self.training_config.num_epochs;
        let batch_size = self.training_config.batch_size;
        let log_interval = self.training_config.log_interval;
        let augmentation = Augmentation::new(self.training_config.max_shift);
        let num_batches = (train_set.len() + batch_size - 1) / batch_size;

        info!(
            "Training on {} samples, testing on {} ({} parameters)",
            train_set.len(),
            test_set.len(),
            self.num_parameters()
        );

        for epoch in 1..=num_epochs {
            self.state.current_epoch = epoch;

            let mut order: Vec<usize> = (0..train_set.len()).collect();
            order.shuffle(&mut self.rng);

            let mut loss_sum = 0.0;
            let mut correct = 0;
            let mut seen = 0;

            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let (mut images, labels) = train_set.gather(chunk);
                augmentation.apply(&mut images, &mut self.rng);
                let batch = Batch::from_images(&images.view(), labels);

                let stats = self.train_batch(&batch, optimizer)?;
                loss_sum += stats.loss.total * stats.size as f32;
                correct += stats.correct;
                seen += stats.size;

                if log_interval > 0 && batch_idx % log_interval == 0 {
                    info!(
                        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                        epoch,
                        batch_idx * batch_size,
                        train_set.len(),
                        100.0 * batch_idx as f32 / num_batches as f32,
                        stats.loss.total
                    );
                }
            }

            let train_loss = loss_sum / seen as f32;
            let train_accuracy = correct as f32 / seen as f32;

            let evaluation = self.evaluate(test_set, self.training_config.test_batch_size)?;
            info!(
                "Test set: Average loss: {:.4}, Accuracy: {}/{} ({:.0}%)",
                evaluation.loss,
                evaluation.metrics.correct,
                evaluation.metrics.total,
                100.0 * evaluation.metrics.accuracy
            );
            debug!(
                margin = evaluation.margin,
                reconstruction = evaluation.reconstruction,
                "test loss parts"
            );

            self.history
                .update(train_loss, evaluation.loss, train_accuracy, evaluation.metrics.accuracy);

            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.step_epoch(optimizer);
                scheduler.step_loss(optimizer, evaluation.loss);
            }

            let improved = self.record_test_loss(evaluation.loss);
            if improved {
                self.state.best_accuracy = evaluation.metrics.accuracy;
                if let (true, Some(path)) = (self.training_config.save_best, checkpoint_path) {
                    Checkpoint::from_model(self).save(path)?;
                    info!("Saved best model (epoch {}) to {}", epoch, path.display());
                }
            }

            if self.should_stop() {
                info!("Early stopping at epoch {}", epoch);
                break;
            }
        }

        self.state.is_trained = true;
        if let (false, Some(path)) = (self.training_config.save_best, checkpoint_path) {
            Checkpoint::from_model(self).save(path)?;
            info!("Saved model to {}", path.display());
        }
        Ok(())
    }

    /// Average loss parts and metrics over a dataset.
    pub fn evaluate(&mut self, dataset: &Dataset, batch_size: usize) -> Result<Evaluation> {
        self.check_labels(dataset)?;
        let num_classes = self.num_classes();
        let mut confusion = vec![vec![0; num_classes]; num_classes];
        let mut totals = LossValue::default();

        for batch in dataset.batches(batch_size) {
            let output = self.forward(&batch.inputs.view(), Some(&batch.labels))?;
            let loss = self.loss_fn.compute(
                &output.digit_caps.view(),
                &batch.labels,
                output.reconstruction.as_ref().map(|r| r.view()),
                &batch.pixels.view(),
            );
            let size = batch.len() as f32;
            totals.total += loss.total * size;
            totals.margin += loss.margin * size;
            totals.reconstruction += loss.reconstruction * size;

            for (pred, &truth) in predicted_classes(&output.lengths.view())
                .into_iter()
                .zip(&batch.labels)
            {
                confusion[truth][pred] += 1;
            }
        }

        let n = dataset.len().max(1) as f32;
        Ok(Evaluation {
            loss: totals.total / n,
            margin: totals.margin / n,
            reconstruction: totals.reconstruction / n,
            metrics: Metrics::from_confusion(confusion),
        })
    }

    /// Predicts a class per input image.
    pub fn predict(&mut self, input: &ArrayView4<f32>) -> Result<Vec<Prediction>> {
        let output = self.forward(input, None)?;
        let classes = predicted_classes(&output.lengths.view());

        Ok(classes
            .into_iter()
            .zip(output.lengths.outer_iter())
            .map(|(class, lengths)| Prediction {
                class,
                lengths: lengths.to_vec(),
            })
            .collect())
    }

    /// Records the test loss; returns whether it improved on the best so far.
    fn record_test_loss(&mut self, loss: f32) -> bool {
        if loss < self.state.best_loss {
            self.state.best_loss = loss;
            self.state.early_stopping_counter = 0;
            true
        } else {
            self.state.early_stopping_counter += 1;
            false
        }
    }

    /// Early stopping
    fn should_stop(&self) -> bool {
        let patience = self.training_config.early_stopping_patience;
        patience > 0 && self.state.early_stopping_counter >= patience
    }

    /// Layer output shapes and parameter counts from a forward pass on a blank image.
    pub fn summary(&mut self) -> Result<Vec<LayerSummary>> {
        let (c, h, w) = self.network_config.input_shape;
        let input = Array4::zeros((1, c, h, w));

        let features = self.conv1.forward(&input.view())?;
        let primary = self.primary.forward(&features.view())?;
        let digit = self.digit.forward(&primary.view())?;

        let mut rows = vec![
            LayerSummary {
                name: "conv1".into(),
                output_shape: features.shape().to_vec(),
                parameters: count_parameters(&mut self.conv1),
            },
            LayerSummary {
                name: "primary_caps".into(),
                output_shape: primary.shape().to_vec(),
                parameters: count_parameters(&mut self.primary),
            },
            LayerSummary {
                name: "digit_caps".into(),
                output_shape: digit.shape().to_vec(),
                parameters: count_parameters(&mut self.digit),
            },
        ];
        if let Some(decoder) = self.decoder.as_mut() {
            let reconstruction = decoder.forward(&digit.view(), &[0])?;
            rows.push(LayerSummary {
                name: "decoder".into(),
                output_shape: reconstruction.shape().to_vec(),
                parameters: count_parameters(decoder),
            });
        }

        info!("Input shape: {:?}", self.network_config.input_shape);
        for row in &rows {
            info!(
                "  {:<14} output {:?}  params {}",
                row.name, row.output_shape, row.parameters
            );
        }
        info!(
            "Total parameters: {}",
            rows.iter().map(|r| r.parameters).sum::<usize>()
        );
        Ok(rows)
    }
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, train_loss: f32, test_loss: f32, train_acc: f32, test_acc: f32) {
        self.train_loss.push(train_loss);
        self.test_loss.push(test_loss);
        self.train_accuracy.push(train_acc);
        self.test_accuracy.push(test_acc);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

impl ModelState {
    pub fn new() -> Self {
        Self {
            is_trained: false,
            best_loss: f32::INFINITY,
            best_accuracy: 0.0,
            current_epoch: 0,
            early_stopping_counter: 0,
        }
    }
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}
