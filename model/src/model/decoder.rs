//! Reconstruction decoder: rebuilds the input image from one digit capsule.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use rand::Rng;

use super::config::Activation;
use super::layers::{Dense, Parameter, Trainable};
use crate::error::{CapsError, Result};

pub struct Decoder {
    pub layers: Vec<Dense>,
    pub num_classes: usize,
    pub capsule_dim: usize,

    mask_cache: Option<Vec<usize>>,
}

impl Decoder {
    /// Hidden layers use ReLU, the output layer a sigmoid so pixels land in [0, 1].
    pub fn new<R: Rng + ?Sized>(
        num_classes: usize,
        capsule_dim: usize,
        hidden_sizes: &[usize],
        output_size: usize,
        rng: &mut R,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden_sizes.len() + 1);
        let mut in_features = num_classes * capsule_dim;
        for &size in hidden_sizes {
            layers.push(Dense::new(in_features, size, Activation::ReLU, rng));
            in_features = size;
        }
        layers.push(Dense::new(in_features, output_size, Activation::Sigmoid, rng));

        Self {
            layers,
            num_classes,
            capsule_dim,
            mask_cache: None,
        }
    }

    /// Zeroes every capsule except the one selected per sample, then flattens.
    fn mask(&self, capsules: &ArrayView3<f32>, selected: &[usize]) -> Array2<f32> {
        let batch_size = capsules.dim().0;
        let dim = self.capsule_dim;
        let mut masked = Array2::zeros((batch_size, self.num_classes * dim));
        for (b, &class) in selected.iter().enumerate() {
            masked
                .slice_mut(s![b, class * dim..(class + 1) * dim])
                .assign(&capsules.slice(s![b, class, ..]));
        }
        masked
    }

    /// Reconstructs (batch, pixels) from capsules masked by `selected`.
    pub fn forward(&mut self, capsules: &ArrayView3<f32>, selected: &[usize]) -> Result<Array2<f32>> {
        let (batch_size, num_classes, dim) = capsules.dim();
        if (num_classes, dim) != (self.num_classes, self.capsule_dim) {
            return Err(CapsError::shape_mismatch(
                "decoder capsules",
                (self.num_classes, self.capsule_dim),
                (num_classes, dim),
            ));
        }
        if selected.len() != batch_size {
            return Err(CapsError::shape_mismatch("decoder mask", batch_size, selected.len()));
        }
        if let Some(&class) = selected.iter().find(|&&c| c >= self.num_classes) {
            return Err(CapsError::data(format!(
                "label {class} out of range for {} classes",
                self.num_classes
            )));
        }

        let mut hidden = self.mask(capsules, selected);
        for layer in &mut self.layers {
            hidden = layer.forward(&hidden.view())?;
        }
        self.mask_cache = Some(selected.to_vec());
        Ok(hidden)
    }

    /// Gradient w.r.t. the capsules; only the masked-in capsule receives any.
    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array3<f32>> {
        let mut grad = grad_output.to_owned();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }

        let selected = self
            .mask_cache
            .as_ref()
            .ok_or(CapsError::MissingActivations("decoder"))?;
        let dim = self.capsule_dim;
        let mut grad_capsules = Array3::zeros((selected.len(), self.num_classes, dim));
        for (b, &class) in selected.iter().enumerate() {
            grad_capsules
                .slice_mut(s![b, class, ..])
                .assign(&grad.slice(s![b, class * dim..(class + 1) * dim]));
        }
        Ok(grad_capsules)
    }
}

impl Trainable for Decoder {
    fn parameters(&mut self, prefix: &str) -> Vec<Parameter<'_>> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, layer)| layer.parameters(&format!("{prefix}.{i}")))
            .collect()
    }

    fn zero_grad(&mut self) {
        self.layers.iter_mut().for_each(Dense::zero_grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn decoder() -> (Decoder, Array3<f32>) {
        let mut rng = StdRng::seed_from_u64(8);
        let decoder = Decoder::new(3, 4, &[6], 10, &mut rng);
        let capsules = Array3::random_using((2, 3, 4), Uniform::new(-0.5f32, 0.5), &mut rng);
        (decoder, capsules)
    }

    #[test]
    fn test_reconstruction_in_unit_range() {
        let (mut decoder, capsules) = decoder();
        let recon = decoder.forward(&capsules.view(), &[0, 2]).unwrap();
        assert_eq!(recon.dim(), (2, 10));
        assert!(recon.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_masked_out_capsules_get_no_gradient() {
        let (mut decoder, capsules) = decoder();
        let recon = decoder.forward(&capsules.view(), &[1, 2]).unwrap();
        let grad = decoder.backward(&Array2::ones(recon.dim()).view()).unwrap();
        assert!(grad.slice(s![0, 0, ..]).iter().all(|&g| g == 0.0));
        assert!(grad.slice(s![0, 2, ..]).iter().all(|&g| g == 0.0));
        assert!(grad.slice(s![1, 1, ..]).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let (mut decoder, capsules) = decoder();
        let selected = [1, 2];
        let mut rng = StdRng::seed_from_u64(21);
        let recon = decoder.forward(&capsules.view(), &selected).unwrap();
        let upstream = Array2::random_using(recon.dim(), Uniform::new(-1.0f32, 1.0), &mut rng);
        let grad = decoder.backward(&upstream.view()).unwrap();

        let h = 1e-3;
        for idx in [(0, 1, 0), (0, 1, 3), (1, 2, 2)] {
            let mut plus = capsules.clone();
            plus[idx] += h;
            let mut minus = capsules.clone();
            minus[idx] -= h;
            let f_plus = (decoder.forward(&plus.view(), &selected).unwrap() * &upstream).sum();
            let f_minus = (decoder.forward(&minus.view(), &selected).unwrap() * &upstream).sum();
            assert_abs_diff_eq!(grad[idx], (f_plus - f_minus) / (2.0 * h), epsilon = 1e-2);
        }
    }

    #[test]
    fn test_label_out_of_range() {
        let (mut decoder, capsules) = decoder();
        assert!(decoder.forward(&capsules.view(), &[0, 3]).is_err());
    }

    #[test]
    fn test_parameter_names() {
        let (mut decoder, _) = decoder();
        let names: Vec<String> = decoder.parameters("decoder").into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["decoder.0.weight", "decoder.0.bias", "decoder.1.weight", "decoder.1.bias"]
        );
    }
}
