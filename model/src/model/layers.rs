use ndarray::{
    s, Array, Array1, Array2, Array3, Array4, ArrayView, ArrayView2, ArrayView3, ArrayView4,
    ArrayViewD, ArrayViewMutD, Axis, Dimension,
};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use crate::error::{CapsError, Result};
use crate::model::config::Activation;

/// Guards the squash norm against division by zero.
pub const SQUASH_EPS: f32 = 1e-8;

/// A named view on a learnable tensor and its accumulated gradient.
pub struct Parameter<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// Anything holding learnable weights.
pub trait Trainable {
    /// Parameters with names prefixed by `prefix`.
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>>;
    fn zero_grad(&mut self);
}

impl Activation {
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    v
                } else {
                    alpha * v
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }

    /// Derivative with respect to the pre-activation value `v`.
    pub fn derivative(self, v: f32) -> f32 {
        match self {
            Activation::ReLU => {
                if v > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let sig = self.apply(v);
                sig * (1.0 - sig)
            }
            Activation::Tanh => 1.0 - v.tanh().powi(2),
            Activation::None => 1.0,
        }
    }
}

/// He-style uniform bound.
fn init_bound(fan_in: usize) -> f32 {
    (2.0 / fan_in as f32).sqrt()
}

/// 2D convolution computed per sample as im2col followed by a matrix product.
pub struct Conv2d {
    /// (out_channels, in_channels * kernel * kernel)
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub in_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,

    input_cache: Option<Array4<f32>>,
    pre_activation_cache: Option<Array4<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let bound = init_bound(fan_in);
        let weights = Array2::random_using((out_channels, fan_in), Uniform::new(-bound, bound), rng);

        Self {
            weight_grad: Array2::zeros(weights.dim()),
            bias_grad: Array1::zeros(out_channels),
            weights,
            biases: Array1::zeros(out_channels),
            in_channels,
            kernel_size,
            stride,
            padding,
            activation,
            input_cache: None,
            pre_activation_cache: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        let k = self.kernel_size;
        (
            (height + 2 * self.padding - k) / self.stride + 1,
            (width + 2 * self.padding - k) / self.stride + 1,
        )
    }

    fn pad(&self, sample: &ArrayView3<f32>) -> Array3<f32> {
        let p = self.padding;
        if p == 0 {
            return sample.to_owned();
        }
        let (c, h, w) = sample.dim();
        let mut padded = Array3::zeros((c, h + 2 * p, w + 2 * p));
        padded.slice_mut(s![.., p..h + p, p..w + p]).assign(sample);
        padded
    }

    /// Unfolds a (C, H, W) sample into (C * k * k, out_h * out_w) patch columns.
    fn im2col(&self, sample: &ArrayView3<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
        let padded = self.pad(sample);
        let k = self.kernel_size;
        let mut cols = Array2::zeros((self.in_channels * k * k, out_h * out_w));
        for ic in 0..self.in_channels {
            for kh in 0..k {
                for kw in 0..k {
                    let row = (ic * k + kh) * k + kw;
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            cols[[row, oh * out_w + ow]] =
                                padded[[ic, oh * self.stride + kh, ow * self.stride + kw]];
                        }
                    }
                }
            }
        }
        cols
    }

    /// Folds patch-column gradients back onto a (C, H, W) input gradient.
    fn col2im(&self, cols: &ArrayView2<f32>, height: usize, width: usize) -> Array3<f32> {
        let (k, p) = (self.kernel_size, self.padding);
        let (out_h, out_w) = self.output_size(height, width);
        let mut padded = Array3::zeros((self.in_channels, height + 2 * p, width + 2 * p));
        for ic in 0..self.in_channels {
            for kh in 0..k {
                for kw in 0..k {
                    let row = (ic * k + kh) * k + kw;
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            padded[[ic, oh * self.stride + kh, ow * self.stride + kw]] +=
                                cols[[row, oh * out_w + ow]];
                        }
                    }
                }
            }
        }
        if p == 0 {
            padded
        } else {
            padded.slice(s![.., p..height + p, p..width + p]).to_owned()
        }
    }

    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch_size, channels, height, width) = input.dim();
        if channels != self.in_channels {
            return Err(CapsError::shape_mismatch(
                "conv input channels",
                self.in_channels,
                channels,
            ));
        }
        let (out_h, out_w) = self.output_size(height, width);
        let mut pre_activation = Array4::zeros((batch_size, self.out_channels(), out_h, out_w));

        pre_activation
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out)| {
                let cols = self.im2col(&input.index_axis(Axis(0), b), out_h, out_w);
                let mut result = self.weights.dot(&cols);
                result += &self.biases.view().insert_axis(Axis(1));
                // (out, oh * ow) and (out, oh, ow) share the same logical order
                out.iter_mut().zip(result.iter()).for_each(|(dst, &v)| *dst = v);
            });

        let output = pre_activation.mapv(|v| self.activation.apply(v));
        self.input_cache = Some(input.to_owned());
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    /// Accumulates weight gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("conv"))?;
        let pre_activation = self
            .pre_activation_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("conv"))?;

        let mut grad = grad_output.to_owned();
        grad.zip_mut_with(pre_activation, |g, &z| *g *= self.activation.derivative(z));

        let (batch_size, _, height, width) = input.dim();
        let (_, out_channels, out_h, out_w) = grad.dim();
        let mut grad_input = Array4::zeros((batch_size, self.in_channels, height, width));

        let zeros = || {
            (
                Array2::<f32>::zeros(self.weights.dim()),
                Array1::<f32>::zeros(out_channels),
            )
        };
        let (weight_grad, bias_grad) = grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .fold(|| zeros(), |(mut dw, mut db), (b, mut dx)| {
                let sample_grad = grad.index_axis(Axis(0), b);
                let mut g = Array2::zeros((out_channels, out_h * out_w));
                g.iter_mut().zip(sample_grad.iter()).for_each(|(dst, &v)| *dst = v);

                let cols = self.im2col(&input.index_axis(Axis(0), b), out_h, out_w);
                dw += &g.dot(&cols.t());
                db += &g.sum_axis(Axis(1));

                let grad_cols = self.weights.t().dot(&g);
                dx.assign(&self.col2im(&grad_cols.view(), height, width));
                (dw, db)
            })
            .reduce(|| zeros(), |(dw1, db1), (dw2, db2)| (dw1 + &dw2, db1 + &db2));

        self.weight_grad += &weight_grad;
        self.bias_grad += &bias_grad;
        Ok(grad_input)
    }
}

impl Trainable for Conv2d {
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>> {
        vec![
            Parameter {
                name: format!("{prefix}.weight"),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            Parameter {
                name: format!("{prefix}.bias"),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

/// Fully connected layer, `y = act(x W + b)`.
pub struct Dense {
    /// (in_features, out_features)
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,

    input_cache: Option<Array2<f32>>,
    pre_activation_cache: Option<Array2<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let bound = init_bound(in_features);
        let weights = Array2::random_using(
            (in_features, out_features),
            Uniform::new(-bound, bound),
            rng,
        );
        Self {
            weight_grad: Array2::zeros(weights.dim()),
            bias_grad: Array1::zeros(out_features),
            weights,
            biases: Array1::zeros(out_features),
            activation,
            input_cache: None,
            pre_activation_cache: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.in_features() {
            return Err(CapsError::shape_mismatch(
                "dense input features",
                self.in_features(),
                input.ncols(),
            ));
        }
        let pre_activation = input.dot(&self.weights) + &self.biases;
        let output = pre_activation.mapv(|v| self.activation.apply(v));
        self.input_cache = Some(input.to_owned());
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("dense"))?;
        let pre_activation = self
            .pre_activation_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("dense"))?;

        let mut grad = grad_output.to_owned();
        grad.zip_mut_with(pre_activation, |g, &z| *g *= self.activation.derivative(z));

        self.weight_grad += &input.t().dot(&grad);
        self.bias_grad += &grad.sum_axis(Axis(0));
        Ok(grad.dot(&self.weights.t()))
    }
}

impl Trainable for Dense {
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>> {
        vec![
            Parameter {
                name: format!("{prefix}.weight"),
                value: self.weights.view_mut().into_dyn(),
                grad: self.weight_grad.view().into_dyn(),
            },
            Parameter {
                name: format!("{prefix}.bias"),
                value: self.biases.view_mut().into_dyn(),
                grad: self.bias_grad.view().into_dyn(),
            },
        ]
    }

    fn zero_grad(&mut self) {
        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
    }
}

fn squash_factor(norm_sq: f32) -> f32 {
    norm_sq / (1.0 + norm_sq) / (norm_sq + SQUASH_EPS).sqrt()
}

/// Squashes every vector along the last axis to a length in [0, 1).
pub fn squash<D: Dimension>(input: &ArrayView<f32, D>) -> Array<f32, D> {
    let last = Axis(input.ndim() - 1);
    let mut output = input.to_owned();
    for mut lane in output.lanes_mut(last) {
        let norm_sq = lane.dot(&lane);
        lane *= squash_factor(norm_sq);
    }
    output
}

/// Vector-Jacobian product of [`squash`]: gradient w.r.t. its input.
pub fn squash_backward<D: Dimension>(
    input: &ArrayView<f32, D>,
    grad_output: &ArrayView<f32, D>,
) -> Array<f32, D> {
    let last = Axis(input.ndim() - 1);
    let mut grad = grad_output.to_owned();
    for (vector, mut g) in input.lanes(last).into_iter().zip(grad.lanes_mut(last)) {
        let norm_sq = vector.dot(&vector);
        let r_sq = norm_sq + SQUASH_EPS;
        let r = r_sq.sqrt();
        let factor = squash_factor(norm_sq);
        // d factor / d |s|^2
        let dfactor = (r - norm_sq * (1.0 + norm_sq) / (2.0 * r)) / ((1.0 + norm_sq).powi(2) * r_sq);
        let projection = vector.dot(&g);
        g *= factor;
        g.scaled_add(2.0 * dfactor * projection, &vector);
    }
    grad
}
