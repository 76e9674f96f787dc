use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use tracing::info;

use super::config::LossConfig;
use crate::error::{CapsError, Result};

/// Length of every capsule along the last axis, (batch, capsules).
pub fn capsule_lengths(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules.map_axis(Axis(2), |v| (v.dot(&v) + 1e-8).sqrt())
}

/// Index of the longest capsule per sample.
pub fn predicted_classes(lengths: &ArrayView2<f32>) -> Vec<usize> {
    lengths
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (c, &len)| {
                    if len > best.1 {
                        (c, len)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Margin Loss for CapsNet (Sabour et al., 2017)
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // lambda = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    fn class_loss(&self, length: f32, present: bool) -> f32 {
        if present {
            // T_k * max(0, m+ - ||v_k||)^2
            (self.positive_margin - length).max(0.0).powi(2)
        } else {
            // lambda * (1 - T_k) * max(0, ||v_k|| - m-)^2
            self.down_weighting * (length - self.negative_margin).max(0.0).powi(2)
        }
    }

    fn class_loss_derivative(&self, length: f32, present: bool) -> f32 {
        if present {
            -2.0 * (self.positive_margin - length).max(0.0)
        } else {
            2.0 * self.down_weighting * (length - self.negative_margin).max(0.0)
        }
    }

    /// Summed over classes, averaged over the batch.
    pub fn compute(&self, capsules: &ArrayView3<f32>, labels: &[usize]) -> f32 {
        let lengths = capsule_lengths(capsules);
        let total: f32 = lengths
            .outer_iter()
            .zip(labels)
            .map(|(row, &label)| {
                row.iter()
                    .enumerate()
                    .map(|(c, &len)| self.class_loss(len, c == label))
                    .sum::<f32>()
            })
            .sum();
        total / labels.len().max(1) as f32
    }

    /// Gradient of [`MarginLoss::compute`] w.r.t. the capsules.
    pub fn gradient(&self, capsules: &ArrayView3<f32>, labels: &[usize]) -> Array3<f32> {
        let lengths = capsule_lengths(capsules);
        let scale = 1.0 / labels.len().max(1) as f32;
        let mut grad = capsules.to_owned();

        for (b, &label) in labels.iter().enumerate() {
            for c in 0..lengths.ncols() {
                let length = lengths[[b, c]];
                // d||v|| / dv = v / ||v||
                let factor = scale * self.class_loss_derivative(length, c == label) / length;
                grad.index_axis_mut(Axis(0), b)
                    .index_axis_mut(Axis(0), c)
                    .mapv_inplace(|v| v * factor);
            }
        }

        grad
    }
}

/// Sum of squared pixel errors, scaled by `weight` and averaged over the batch.
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    pub weight: f32,
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    pub fn compute(&self, reconstruction: &ArrayView2<f32>, target: &ArrayView2<f32>) -> f32 {
        let batch_size = reconstruction.nrows().max(1) as f32;
        let sse: f32 = reconstruction
            .iter()
            .zip(target.iter())
            .map(|(r, x)| (r - x).powi(2))
            .sum();
        self.weight * sse / batch_size
    }

    pub fn gradient(&self, reconstruction: &ArrayView2<f32>, target: &ArrayView2<f32>) -> Array2<f32> {
        let batch_size = reconstruction.nrows().max(1) as f32;
        (reconstruction - target) * (2.0 * self.weight / batch_size)
    }
}

/// Loss value split into its parts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValue {
    pub total: f32,
    pub margin: f32,
    pub reconstruction: f32,
}

/// Margin loss plus the optional reconstruction penalty.
#[derive(Debug, Clone)]
pub struct CapsuleLoss {
    pub margin_loss: MarginLoss,
    pub reconstruction_loss: Option<ReconstructionLoss>,
}

impl CapsuleLoss {
    pub fn new(config: &LossConfig, with_reconstruction: bool) -> Self {
        Self {
            margin_loss: MarginLoss::new(
                config.positive_margin,
                config.negative_margin,
                config.down_weighting,
            ),
            reconstruction_loss: with_reconstruction
                .then(|| ReconstructionLoss::new(config.reconstruction_weight)),
        }
    }

    pub fn compute(
        &self,
        capsules: &ArrayView3<f32>,
        labels: &[usize],
        reconstruction: Option<ArrayView2<'_, f32>>,
        pixels: &ArrayView2<f32>,
    ) -> LossValue {
        let margin = self.margin_loss.compute(capsules, labels);
        let reconstruction = match (reconstruction, &self.reconstruction_loss) {
            (Some(recon), Some(loss)) => loss.compute(&recon, pixels),
            _ => 0.0,
        };
        LossValue {
            total: margin + reconstruction,
            margin,
            reconstruction,
        }
    }
}

/// Evaluation metrics
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub accuracy: f32,
    pub correct: usize,
    pub total: usize,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    /// Rows are true classes, columns predictions
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    pub fn compute(predicted: &[usize], labels: &[usize], num_classes: usize) -> Result<Self> {
        let mut confusion = vec![vec![0; num_classes]; num_classes];
        for (&pred, &truth) in predicted.iter().zip(labels) {
            if pred >= num_classes || truth >= num_classes {
                return Err(CapsError::data(format!(
                    "class pair ({truth}, {pred}) outside {num_classes} classes"
                )));
            }
            confusion[truth][pred] += 1;
        }
        Ok(Self::from_confusion(confusion))
    }

    pub fn from_confusion(confusion: Vec<Vec<usize>>) -> Self {
        let num_classes = confusion.len();
        let total: usize = confusion.iter().flatten().sum();
        let correct: usize = (0..num_classes).map(|c| confusion[c][c]).sum();
        let accuracy = if total > 0 {
            correct as f32 / total as f32
        } else {
            0.0
        };

        let mut precision = Vec::with_capacity(num_classes);
        let mut recall = Vec::with_capacity(num_classes);
        let mut f1_score = Vec::with_capacity(num_classes);

        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let fp: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[i][c] as f32)
                .sum();
            let fn_: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[c][i] as f32)
                .sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 {
                2.0 * prec * rec / (prec + rec)
            } else {
                0.0
            };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
        }

        Self {
            accuracy,
            correct,
            total,
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
        }
    }

    pub fn log(&self) {
        info!(
            "Accuracy: {:.4} ({}/{})",
            self.accuracy, self.correct, self.total
        );
        for (i, ((p, r), f1)) in self
            .precision
            .iter()
            .zip(&self.recall)
            .zip(&self.f1_score)
            .enumerate()
        {
            info!("  class {i}: precision={p:.4} recall={r:.4} f1={f1:.4}");
        }
        info!("Confusion matrix (rows = truth):");
        for row in &self.confusion_matrix {
            info!("  {:?}", row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_margin_loss() {
        let loss_fn = MarginLoss::new(0.9, 0.1, 0.5);

        let capsules = Array3::from_elem((2, 2, 8), 0.5);
        let loss = loss_fn.compute(&capsules.view(), &[0, 1]);
        assert!(loss > 0.0);
    }

    #[test]
    fn test_margin_loss_values() {
        let loss_fn = MarginLoss::new(0.9, 0.1, 0.5);
        // lengths 0.6 (true class) and 0.3 (absent class)
        let capsules = array![[[0.6f32, 0.0], [0.0, 0.3]]];
        let loss = loss_fn.compute(&capsules.view(), &[0]);
        let expected = 0.3f32.powi(2) + 0.5 * 0.2f32.powi(2);
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_margin_loss_zero_when_confident() {
        let loss_fn = MarginLoss::new(0.9, 0.1, 0.5);
        let capsules = array![[[0.95f32, 0.0], [0.05, 0.0]]];
        assert_abs_diff_eq!(loss_fn.compute(&capsules.view(), &[0]), 0.0, epsilon = 1e-6);
        let grad = loss_fn.gradient(&capsules.view(), &[0]);
        assert!(grad.iter().all(|&g| g.abs() < 1e-6));
    }

    #[test]
    fn test_margin_gradient_matches_finite_differences() {
        let loss_fn = MarginLoss::new(0.9, 0.1, 0.5);
        let capsules = array![[[0.3f32, 0.2, -0.1], [0.4, 0.1, 0.2]], [[0.1f32, 0.1, 0.0], [0.5, 0.6, -0.2]]];
        let labels = [1, 0];
        let grad = loss_fn.gradient(&capsules.view(), &labels);

        let h = 1e-3;
        for idx in [(0, 0, 0), (0, 1, 2), (1, 0, 1), (1, 1, 1)] {
            let mut plus = capsules.clone();
            plus[idx] += h;
            let mut minus = capsules.clone();
            minus[idx] -= h;
            let numeric = (loss_fn.compute(&plus.view(), &labels)
                - loss_fn.compute(&minus.view(), &labels))
                / (2.0 * h);
            assert_abs_diff_eq!(grad[idx], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_reconstruction_loss() {
        let loss_fn = ReconstructionLoss::new(0.5);
        let recon = array![[0.5f32, 1.0], [0.0, 0.0]];
        let target = array![[0.0f32, 1.0], [1.0, 0.0]];
        // (0.25 + 1.0) / 2 batch * 0.5
        assert_abs_diff_eq!(loss_fn.compute(&recon.view(), &target.view()), 0.3125, epsilon = 1e-6);
        let grad = loss_fn.gradient(&recon.view(), &target.view());
        assert_abs_diff_eq!(grad[[0, 0]], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[1, 0]], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_capsule_loss_without_decoder() {
        let loss = CapsuleLoss::new(&LossConfig::default(), false);
        let capsules = Array3::from_elem((1, 3, 4), 0.2);
        let pixels = Array2::zeros((1, 4));
        let recon = Array2::ones((1, 4));
        let value = loss.compute(&capsules.view(), &[2], Some(recon.view()), &pixels.view());
        assert_eq!(value.reconstruction, 0.0);
        assert_eq!(value.total, value.margin);
    }

    #[test]
    fn test_predicted_classes() {
        let lengths = array![[0.1f32, 0.8, 0.3], [0.9, 0.2, 0.95]];
        assert_eq!(predicted_classes(&lengths.view()), vec![1, 2]);
    }

    #[test]
    fn test_metrics() {
        let metrics = Metrics::compute(&[0, 1, 1, 2], &[0, 1, 2, 2], 3).unwrap();
        assert_abs_diff_eq!(metrics.accuracy, 0.75, epsilon = 1e-6);
        assert_eq!(metrics.correct, 3);
        assert_eq!(metrics.confusion_matrix[2][1], 1);
        assert_abs_diff_eq!(metrics.precision[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.recall[2], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.f1_score[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_metrics_rejects_unknown_class() {
        assert!(matches!(
            Metrics::compute(&[0], &[5], 3),
            Err(CapsError::Data(_))
        ));
        assert!(Metrics::compute(&[4, 1], &[0, 1], 3).is_err());
    }
}
