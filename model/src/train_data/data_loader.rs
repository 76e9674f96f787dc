use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::read::GzDecoder;
use image::imageops::FilterType;
use image::ImageReader;
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis};
use tracing::{debug, info};

use crate::error::{CapsError, Result};

/// Per-pixel mean of the MNIST training set.
pub const MNIST_MEAN: f32 = 0.1307;
/// Per-pixel standard deviation of the MNIST training set.
pub const MNIST_STD: f32 = 0.3081;

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

/// Reads the MNIST IDX files from a directory.
pub struct MnistDataLoader {
    data_dir: PathBuf,
    limit: Option<usize>,
}

impl MnistDataLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            limit: None,
        }
    }

    /// Keep at most `limit` samples per split.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn load_train(&self) -> Result<Dataset> {
        self.load_split("train")
    }

    pub fn load_test(&self) -> Result<Dataset> {
        self.load_split("t10k")
    }

    fn load_split(&self, prefix: &str) -> Result<Dataset> {
        let start = Instant::now();
        let images_path = self.find_file(prefix, "images", "idx3")?;
        let labels_path = self.find_file(prefix, "labels", "idx1")?;
        debug!(images = %images_path.display(), labels = %labels_path.display(), "reading IDX files");

        let images = parse_idx_images(&read_file(&images_path)?, self.limit)?;
        let labels = parse_idx_labels(&read_file(&labels_path)?, self.limit)?;
        let dataset = Dataset::new(images, labels)?;

        info!(
            "Loaded {} {} samples ({}x{}) in {:?}",
            dataset.len(),
            prefix,
            dataset.image_size().0,
            dataset.image_size().1,
            start.elapsed()
        );
        Ok(dataset)
    }

    /// Accepts `train-images-idx3-ubyte`, `train-images.idx3-ubyte` and their
    /// `.gz` forms, directly in the data directory or under `raw/`.
    fn find_file(&self, prefix: &str, kind: &str, idx: &str) -> Result<PathBuf> {
        let stems = [
            format!("{prefix}-{kind}-{idx}-ubyte"),
            format!("{prefix}-{kind}.{idx}-ubyte"),
        ];
        let dirs = [self.data_dir.clone(), self.data_dir.join("raw")];

        for dir in &dirs {
            for stem in &stems {
                for name in [stem.clone(), format!("{stem}.gz")] {
                    let path = dir.join(name);
                    if path.is_file() {
                        return Ok(path);
                    }
                }
            }
        }

        Err(CapsError::data(format!(
            "{} not found in {}",
            stems[0],
            self.data_dir.display()
        )))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        let mut bytes = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut bytes)?;
        Ok(bytes)
    } else {
        Ok(raw)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| CapsError::data("truncated IDX header"))
}

/// Parses an IDX3 image file into (count, rows, cols).
pub fn parse_idx_images(bytes: &[u8], limit: Option<usize>) -> Result<Array3<u8>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGES_MAGIC {
        return Err(CapsError::data(format!(
            "bad IDX image magic {magic}, expected {IMAGES_MAGIC}"
        )));
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;

    let size = count
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .ok_or_else(|| CapsError::data("IDX dimensions overflow"))?;

    let body = &bytes[16..];
    if body.len() < size {
        return Err(CapsError::data(format!(
            "IDX image file truncated: {} of {size} bytes",
            body.len()
        )));
    }

    let n = limit.map_or(count, |l| l.min(count));
    Ok(Array3::from_shape_vec(
        (n, rows, cols),
        body[..n * rows * cols].to_vec(),
    )?)
}

/// Parses an IDX1 label file.
pub fn parse_idx_labels(bytes: &[u8], limit: Option<usize>) -> Result<Vec<usize>> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABELS_MAGIC {
        return Err(CapsError::data(format!(
            "bad IDX label magic {magic}, expected {LABELS_MAGIC}"
        )));
    }
    let count = read_u32(bytes, 4)? as usize;

    let body = &bytes[8..];
    if body.len() < count {
        return Err(CapsError::data(format!(
            "IDX label file truncated: {} of {} labels",
            body.len(),
            count
        )));
    }

    let n = limit.map_or(count, |l| l.min(count));
    Ok(body[..n].iter().map(|&l| l as usize).collect())
}

/// Grayscale images with their class labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// (count, height, width)
    pub images: Array3<u8>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn new(images: Array3<u8>, labels: Vec<usize>) -> Result<Self> {
        if images.dim().0 != labels.len() {
            return Err(CapsError::data(format!(
                "{} images but {} labels",
                images.dim().0,
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// (height, width)
    pub fn image_size(&self) -> (usize, usize) {
        let (_, h, w) = self.images.dim();
        (h, w)
    }

    /// Copies the samples at `indices`.
    pub fn gather(&self, indices: &[usize]) -> (Array3<u8>, Vec<usize>) {
        let images = self.images.select(Axis(0), indices);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        (images, labels)
    }

    pub fn batch(&self, indices: &[usize]) -> Batch {
        let (images, labels) = self.gather(indices);
        Batch::from_images(&images.view(), labels)
    }

    /// Batches in dataset order.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let indices: Vec<usize> = (0..self.len()).collect();
        let chunks: Vec<Vec<usize>> = indices
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();
        chunks.into_iter().map(move |chunk| self.batch(&chunk))
    }
}

/// Network-ready tensors for a group of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, 1, height, width), normalised with the MNIST mean and std
    pub inputs: Array4<f32>,
    /// (batch, height * width) in [0, 1], the reconstruction target
    pub pixels: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn from_images(images: &ArrayView3<u8>, labels: Vec<usize>) -> Self {
        let (n, h, w) = images.dim();
        let scaled = images.mapv(|p| p as f32 / 255.0);
        let pixels = Array2::from_shape_fn((n, h * w), |(b, p)| scaled[[b, p / w, p % w]]);
        let inputs = scaled
            .mapv(|p| (p - MNIST_MEAN) / MNIST_STD)
            .insert_axis(Axis(1));

        Self {
            inputs,
            pixels,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads a PNG/JPEG as a grayscale (height, width) image.
///
/// MNIST digits are white on black; `invert` flips dark-on-light scans.
pub fn load_image(path: impl AsRef<Path>, size: (usize, usize), invert: bool) -> Result<Array2<u8>> {
    let (height, width) = size;
    let img = ImageReader::open(path.as_ref())?
        .with_guessed_format()?
        .decode()?;
    let luma = img
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_luma8();

    let mut pixels = Array2::from_shape_vec((height, width), luma.into_raw())?;
    if invert {
        pixels.mapv_inplace(|p| 255 - p);
    }
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn idx_images(count: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend((0..count * rows * cols).map(|i| (i % 256) as u8));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_parse_images() {
        let images = parse_idx_images(&idx_images(3, 2, 2), None).unwrap();
        assert_eq!(images.dim(), (3, 2, 2));
        assert_eq!(images[[1, 0, 1]], 5);
    }

    #[test]
    fn test_parse_respects_limit() {
        let images = parse_idx_images(&idx_images(5, 2, 2), Some(2)).unwrap();
        assert_eq!(images.dim(), (2, 2, 2));
        let labels = parse_idx_labels(&idx_labels(&[1, 2, 3]), Some(10)).unwrap();
        assert_eq!(labels, vec![1, 2, 3]);
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut bytes = idx_images(2, 2, 2);
        assert!(parse_idx_images(&bytes[..bytes.len() - 1], None).is_err());
        bytes[3] = 0;
        assert!(parse_idx_images(&bytes, None).is_err());
        assert!(parse_idx_labels(&idx_images(1, 1, 1), None).is_err());
        assert!(parse_idx_labels(&[0, 0], None).is_err());
    }

    #[test]
    fn test_header_dimensions_overflow() {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        assert!(matches!(
            parse_idx_images(&bytes, None),
            Err(CapsError::Data(_))
        ));
    }

    #[test]
    fn test_loader_reads_plain_and_gzip_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("train-images-idx3-ubyte"), idx_images(4, 3, 3)).unwrap();
        fs::write(dir.path().join("train-labels-idx1-ubyte"), idx_labels(&[0, 1, 2, 3])).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&idx_images(2, 3, 3)).unwrap();
        fs::write(dir.path().join("t10k-images.idx3-ubyte.gz"), encoder.finish().unwrap()).unwrap();
        fs::write(dir.path().join("t10k-labels.idx1-ubyte"), idx_labels(&[7, 8])).unwrap();

        let loader = MnistDataLoader::new(dir.path());
        let train = loader.load_train().unwrap();
        let test = loader.load_test().unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(train.image_size(), (3, 3));
        assert_eq!(test.labels, vec![7, 8]);
    }

    #[test]
    fn test_loader_searches_raw_subdirectory() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir(&raw).unwrap();
        fs::write(raw.join("t10k-images-idx3-ubyte"), idx_images(3, 2, 2)).unwrap();
        fs::write(raw.join("t10k-labels-idx1-ubyte"), idx_labels(&[4, 5, 6])).unwrap();

        let test = MnistDataLoader::new(dir.path()).load_test().unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(test.labels, vec![4, 5, 6]);
        assert!(MnistDataLoader::new(dir.path()).load_train().is_err());
    }

    #[test]
    fn test_missing_files() {
        let dir = tempdir().unwrap();
        assert!(MnistDataLoader::new(dir.path()).load_train().is_err());
    }

    #[test]
    fn test_batch_tensors() {
        let images = Array3::from_shape_vec((2, 2, 2), vec![0u8, 255, 0, 0, 51, 0, 0, 255]).unwrap();
        let dataset = Dataset::new(images, vec![3, 4]).unwrap();

        let batches: Vec<Batch> = dataset.batches(1).collect();
        assert_eq!(batches.len(), 2);
        let batch = &batches[1];
        assert_eq!(batch.inputs.dim(), (1, 1, 2, 2));
        assert_eq!(batch.pixels.dim(), (1, 4));
        assert_eq!(batch.labels, vec![4]);
        assert!((batch.pixels[[0, 0]] - 0.2).abs() < 1e-6);
        assert!((batch.inputs[[0, 0, 0, 1]] + MNIST_MEAN / MNIST_STD).abs() < 1e-5);
    }

    #[test]
    fn test_dataset_length_mismatch() {
        assert!(Dataset::new(Array3::zeros((2, 1, 1)), vec![0]).is_err());
    }

    #[test]
    fn test_load_image_inverts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("digit.png");
        image::GrayImage::from_pixel(4, 4, image::Luma([250u8]))
            .save(&path)
            .unwrap();

        let pixels = load_image(&path, (2, 2), true).unwrap();
        assert_eq!(pixels.dim(), (2, 2));
        assert!(pixels.iter().all(|&p| p == 5));
    }
}
