use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::Rng;

/// Random translation of training images, zero filled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Augmentation {
    pub max_shift: usize,
}

/// Source and destination ranges along one axis for a shift.
fn shifted_ranges(shift: isize, len: usize) -> Option<(Range<usize>, Range<usize>)> {
    let offset = shift.unsigned_abs();
    if offset >= len {
        return None;
    }
    if shift >= 0 {
        Some((0..len - offset, offset..len))
    } else {
        Some((offset..len, 0..len - offset))
    }
}

impl Augmentation {
    pub fn new(max_shift: usize) -> Self {
        Self { max_shift }
    }

    pub fn is_identity(&self) -> bool {
        self.max_shift == 0
    }

    /// Moves the image `dy` pixels down and `dx` right.
    pub fn shift(image: &ArrayView2<u8>, dy: isize, dx: isize) -> Array2<u8> {
        let (h, w) = image.dim();
        let mut out = Array2::zeros((h, w));
        if let (Some((src_y, dst_y)), Some((src_x, dst_x))) =
            (shifted_ranges(dy, h), shifted_ranges(dx, w))
        {
            out.slice_mut(s![dst_y, dst_x])
                .assign(&image.slice(s![src_y, src_x]));
        }
        out
    }

    /// Shifts every image by an independent offset in `[-max_shift, max_shift]`.
    pub fn apply<R: Rng + ?Sized>(&self, images: &mut Array3<u8>, rng: &mut R) {
        if self.is_identity() {
            return;
        }
        let max = self.max_shift as isize;
        for mut image in images.axis_iter_mut(Axis(0)) {
            let dy = rng.gen_range(-max..=max);
            let dx = rng.gen_range(-max..=max);
            if dy != 0 || dx != 0 {
                let shifted = Self::shift(&image.view(), dy, dx);
                image.assign(&shifted);
            }
        }
    }
}
