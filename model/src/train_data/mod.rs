pub mod augmentation;
pub mod data_loader;

pub use augmentation::Augmentation;
pub use data_loader::{load_image, Batch, Dataset, MnistDataLoader, MNIST_MEAN, MNIST_STD};
