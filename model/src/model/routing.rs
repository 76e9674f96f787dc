use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::{squash, squash_backward};

/// Routing-by-agreement between two capsule layers.
pub struct DynamicRouting {
    pub num_iterations: usize,
}

/// Result of routing a batch of predictions.
#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// Squashed output capsules `v_j`, (batch, out_caps, dim)
    pub outputs: Array3<f32>,
    /// Weighted sums `s_j` before squashing, (batch, out_caps, dim)
    pub pre_squash: Array3<f32>,
    /// Final coupling coefficients `c_ij`, (batch, in_caps, out_caps)
    pub coupling: Array3<f32>,
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    /// Routes predictions `u_hat` of shape (batch, in_caps, out_caps, dim).
    ///
    /// Logits start at zero for every example and are only refined between
    /// iterations, so one iteration yields uniform couplings.
    pub fn route(&self, predictions: &ArrayView4<f32>) -> RoutingOutput {
        let (batch_size, in_caps, out_caps, dim) = predictions.dim();

        let per_sample: Vec<_> = predictions
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|sample| self.route_sample(&sample))
            .collect();

        let mut outputs = Array3::zeros((batch_size, out_caps, dim));
        let mut pre_squash = Array3::zeros((batch_size, out_caps, dim));
        let mut coupling = Array3::zeros((batch_size, in_caps, out_caps));
        for (b, (v, s, c)) in per_sample.into_iter().enumerate() {
            outputs.index_axis_mut(Axis(0), b).assign(&v);
            pre_squash.index_axis_mut(Axis(0), b).assign(&s);
            coupling.index_axis_mut(Axis(0), b).assign(&c);
        }

        RoutingOutput {
            outputs,
            pre_squash,
            coupling,
        }
    }

    fn route_sample(&self, predictions: &ArrayView3<f32>) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let (in_caps, out_caps, dim) = predictions.dim();
        let mut logits = Array2::zeros((in_caps, out_caps));
        let mut coupling = Array2::zeros((in_caps, out_caps));
        let mut weighted = Array2::zeros((out_caps, dim));
        let mut outputs = Array2::zeros((out_caps, dim));

        for iteration in 0..self.num_iterations {
            // c_ij = softmax_j(b_ij)
            coupling = softmax(&logits.view());
            // s_j = sum_i c_ij * u_hat_j|i
            weighted = (predictions * &coupling.view().insert_axis(Axis(2))).sum_axis(Axis(0));
            // v_j = squash(s_j)
            outputs = squash(&weighted.view());

            if iteration + 1 < self.num_iterations {
                // b_ij += u_hat_j|i . v_j
                let agreement =
                    (predictions * &outputs.view().insert_axis(Axis(0))).sum_axis(Axis(2));
                logits += &agreement;
            }
        }

        (outputs, weighted, coupling)
    }

    /// Gradient w.r.t. the predictions given the gradient w.r.t. the outputs.
    ///
    /// Coupling coefficients of the last iteration are held constant.
    pub fn backward(&self, routed: &RoutingOutput, grad_outputs: &ArrayView3<f32>) -> Array4<f32> {
        let grad_weighted = squash_backward(&routed.pre_squash.view(), grad_outputs);
        let coupling = routed.coupling.view().insert_axis(Axis(3));
        &coupling * &grad_weighted.view().insert_axis(Axis(1))
    }
}

/// Softmax over the output-capsule axis (axis 1) of (in_caps, out_caps) logits.
pub fn softmax(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();
    for mut row in result.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    result
}
