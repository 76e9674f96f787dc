use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use super::config::Activation;
use super::layers::{squash, squash_backward, Conv2d, Parameter, Trainable};
use super::routing::{DynamicRouting, RoutingOutput};
use crate::error::{CapsError, Result};

/// Standard deviation of the initial digit capsule transforms.
const TRANSFORM_INIT_STD: f32 = 0.01;

/// First capsule layer: `capsule_dim` parallel convolutions, no routing.
///
/// The parallel convolutions share one stacked kernel. Output channel
/// `d * num_capsules + c` is component `d` of capsule type `c`.
pub struct PrimaryCapsLayer {
    pub conv: Conv2d,
    pub num_capsules: usize,
    pub capsule_dim: usize,

    grid_cache: Option<(usize, usize)>,
    pre_squash_cache: Option<Array3<f32>>,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_capsules: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let conv = Conv2d::new(
            in_channels,
            num_capsules * capsule_dim,
            kernel_size,
            stride,
            padding,
            Activation::None,
            rng,
        );
        Self {
            conv,
            num_capsules,
            capsule_dim,
            grid_cache: None,
            pre_squash_cache: None,
        }
    }

    /// Returns squashed capsules (batch, num_capsules * H * W, capsule_dim),
    /// capsule `c * H * W + y * W + x`.
    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let features = self.conv.forward(input)?;
        let (batch_size, _, height, width) = features.dim();
        let capsules = features
            .into_shape((batch_size, self.capsule_dim, self.num_capsules * height * width))?
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .into_owned();

        debug!(
            grid = ?(height, width),
            capsules = capsules.dim().1,
            "primary capsules"
        );

        let output = squash(&capsules.view());
        self.grid_cache = Some((height, width));
        self.pre_squash_cache = Some(capsules);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let capsules = self
            .pre_squash_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("primary capsule"))?;
        let (height, width) = self
            .grid_cache
            .ok_or(CapsError::MissingActivations("primary capsule"))?;

        let grad = squash_backward(&capsules.view(), grad_output);
        let batch_size = grad.dim().0;
        let grad_features = grad
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((
                batch_size,
                self.capsule_dim * self.num_capsules,
                height,
                width,
            ))?;
        self.conv.backward(&grad_features.view())
    }
}

impl Trainable for PrimaryCapsLayer {
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>> {
        self.conv.parameters(prefix)
    }

    fn zero_grad(&mut self) {
        self.conv.zero_grad();
    }
}

/// Output capsule layer fed by dynamic routing.
pub struct DigitCapsLayer {
    pub routing: DynamicRouting,
    pub num_capsules: usize,
    pub capsule_dim: usize,
    /// (in_capsules, out_capsules, out_dim, in_dim)
    pub weights: Array4<f32>,

    weight_grad: Array4<f32>,
    input_cache: Option<Array3<f32>>,
    routing_cache: Option<RoutingOutput>,
}

impl DigitCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        input_capsules: usize,
        input_capsule_dim: usize,
        num_capsules: usize,
        capsule_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Self {
        let shape = (input_capsules, num_capsules, capsule_dim, input_capsule_dim);
        let weights = Array4::random_using(shape, StandardNormal, rng) * TRANSFORM_INIT_STD;

        Self {
            routing: DynamicRouting::new(routing_iterations),
            num_capsules,
            capsule_dim,
            weight_grad: Array4::zeros(weights.dim()),
            weights,
            input_cache: None,
            routing_cache: None,
        }
    }

    /// Coupling coefficients of the most recent forward pass.
    pub fn coupling(&self) -> Option<&Array3<f32>> {
        self.routing_cache.as_ref().map(|r| &r.coupling)
    }

    /// Predictions `u_hat_j|i = W_ij u_i`, (batch, in_caps, out_caps, out_dim).
    fn predict(&self, input: &ArrayView3<f32>) -> Array4<f32> {
        let (batch_size, in_caps, _) = input.dim();
        let mut predictions = Array4::zeros((batch_size, in_caps, self.num_capsules, self.capsule_dim));

        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut sample)| {
                for i in 0..in_caps {
                    let u = input.slice(s![b, i, ..]);
                    for j in 0..self.num_capsules {
                        let transform = self.weights.slice(s![i, j, .., ..]);
                        sample.slice_mut(s![i, j, ..]).assign(&transform.dot(&u));
                    }
                }
            });

        predictions
    }

    pub fn forward(&mut self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (in_caps, _, _, in_dim) = self.weights.dim();
        let (_, got_caps, got_dim) = input.dim();
        if (got_caps, got_dim) != (in_caps, in_dim) {
            return Err(CapsError::shape_mismatch(
                "digit capsule input",
                (in_caps, in_dim),
                (got_caps, got_dim),
            ));
        }

        let predictions = self.predict(input);
        let routed = self.routing.route(&predictions.view());
        let output = routed.outputs.clone();

        self.input_cache = Some(input.to_owned());
        self.routing_cache = Some(routed);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("digit capsule"))?;
        let routed = self
            .routing_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("digit capsule"))?;

        let grad_predictions = self.routing.backward(routed, grad_output);
        let mut grad_input = Array3::zeros(input.dim());

        Zip::from(self.weight_grad.axis_iter_mut(Axis(0)))
            .and(grad_input.axis_iter_mut(Axis(1)))
            .and(self.weights.axis_iter(Axis(0)))
            .and(grad_predictions.axis_iter(Axis(1)))
            .and(input.axis_iter(Axis(1)))
            .par_for_each(|mut dw_i, mut du_i, w_i, g_i, u_i| {
                for j in 0..w_i.dim().0 {
                    // g_ij: (batch, out_dim), W_ij: (out_dim, in_dim)
                    let g_ij = g_i.index_axis(Axis(1), j);
                    let mut dw_ij = dw_i.index_axis_mut(Axis(0), j);
                    dw_ij += &g_ij.t().dot(&u_i);
                    du_i += &g_ij.dot(&w_i.index_axis(Axis(0), j));
                }
            });

        Ok(grad_input)
    }
}

impl Trainable for DigitCapsLayer {
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>> {
        vec![Parameter {
            name: format!("{prefix}.weight"),
            value: self.weights.view_mut().into_dyn(),
            grad: self.weight_grad.view().into_dyn(),
        }]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand_distr::Uniform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_primary_caps_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = PrimaryCapsLayer::new(4, 3, 2, 3, 2, 0, &mut rng);
        let input = Array4::random_using((2, 4, 9, 9), Uniform::new(-1.0f32, 1.0), &mut rng);
        let capsules = layer.forward(&input.view()).unwrap();
        // 9x9 input, k3 s2 -> 4x4 grid, 3 capsule types
        assert_eq!(capsules.dim(), (2, 3 * 16, 2));

        let features = layer.conv.forward(&input.view()).unwrap();
        let raw = layer.pre_squash_cache.as_ref().unwrap();
        // capsule type 2 at (y=1, x=3), component 1 -> channel 1 * 3 + 2
        assert_abs_diff_eq!(raw[[1, 2 * 16 + 4 + 3, 1]], features[[1, 5, 1, 3]], epsilon = 1e-6);
        for lane in capsules.lanes(Axis(2)) {
            assert!(lane.dot(&lane).sqrt() < 1.0);
        }
    }

    #[test]
    fn test_primary_caps_backward_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = PrimaryCapsLayer::new(2, 4, 3, 3, 1, 1, &mut rng);
        let input = Array4::random_using((2, 2, 5, 5), Uniform::new(-1.0f32, 1.0), &mut rng);
        let capsules = layer.forward(&input.view()).unwrap();
        let grad = layer.backward(&Array3::ones(capsules.dim()).view()).unwrap();
        assert_eq!(grad.dim(), input.dim());
    }

    #[test]
    fn test_digit_caps_output() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = DigitCapsLayer::new(12, 8, 10, 16, 3, &mut rng);
        let input = squash(&Array3::random_using((3, 12, 8), Uniform::new(-1.0f32, 1.0), &mut rng).view());
        let output = layer.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (3, 10, 16));
        assert_eq!(layer.coupling().unwrap().dim(), (3, 12, 10));
    }

    #[test]
    fn test_digit_caps_rejects_wrong_input() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = DigitCapsLayer::new(12, 8, 10, 16, 3, &mut rng);
        let input = Array3::zeros((1, 11, 8));
        assert!(matches!(
            layer.forward(&input.view()),
            Err(CapsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_digit_caps_backward_single_iteration() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = DigitCapsLayer::new(4, 3, 2, 5, 1, &mut rng);
        layer.weights.mapv_inplace(|w| w * 50.0);
        let input = Array3::random_using((2, 4, 3), Uniform::new(-1.0f32, 1.0), &mut rng);
        let upstream = Array3::random_using((2, 2, 5), Uniform::new(-1.0f32, 1.0), &mut rng);

        layer.forward(&input.view()).unwrap();
        let grad_input = layer.backward(&upstream.view()).unwrap();
        let weight_grad = layer.weight_grad.clone();

        let h = 1e-3;
        for idx in [(0, 0, 0), (1, 3, 2)] {
            let mut plus = input.clone();
            plus[idx] += h;
            let mut minus = input.clone();
            minus[idx] -= h;
            let f_plus = (layer.forward(&plus.view()).unwrap() * &upstream).sum();
            let f_minus = (layer.forward(&minus.view()).unwrap() * &upstream).sum();
            assert_abs_diff_eq!(grad_input[idx], (f_plus - f_minus) / (2.0 * h), epsilon = 1e-2);
        }

        let idx = (2, 1, 4, 0);
        layer.weights[idx] += h;
        let f_plus = (layer.forward(&input.view()).unwrap() * &upstream).sum();
        layer.weights[idx] -= 2.0 * h;
        let f_minus = (layer.forward(&input.view()).unwrap() * &upstream).sum();
        assert_abs_diff_eq!(weight_grad[idx], (f_plus - f_minus) / (2.0 * h), epsilon = 1e-2);
    }
}
