use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator, batcher::Batcher};
use burn::data::dataset::{Dataset, InMemDataset};
use burn::prelude::*;
use image::{DynamicImage, ImageReader, imageops::FilterType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{GanError, Result};

/// One image, channel-major (`[C, H, W]`), normalised to `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub image: Vec<f32>,
}

/// Supplier of real training batches.
pub trait ImageSource<B: Backend> {
    /// Next `[batch_size, C, H, W]` batch of real images in `[-1, 1]`.
    fn next_batch(&mut self, batch_size: usize, device: &B::Device) -> Result<Tensor<B, 4>>;
}

/// Image files found in a directory, decoded and resized lazily.
pub struct ImageFolderDataset {
    pub image_paths: Vec<PathBuf>,
    size: u32,
    channels: usize,
}

impl ImageFolderDataset {
    pub fn new<P: AsRef<Path>>(path: P, size: usize, channels: usize) -> Result<Self> {
        let path = path.as_ref();
        let entries = std::fs::read_dir(path)
            .map_err(|e| GanError::data(format!("cannot read {}: {e}", path.display())))?;

        let mut image_paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                    match ext.to_lowercase().as_str() {
                        "jpg" | "jpeg" | "png" | "bmp" | "tiff" => {
                            readable_header(&path)?;
                            image_paths.push(path);
                        }
                        _ => {}
                    }
                }
            }
        }
        if image_paths.is_empty() {
            return Err(GanError::data(format!(
                "no valid image files found in {}",
                path.display()
            )));
        }
        image_paths.sort();
        info!(
            "found {} training images in {}",
            image_paths.len(),
            path.display()
        );

        Ok(Self {
            image_paths,
            size: size as u32,
            channels,
        })
    }

    fn decode(&self, path: &Path) -> Option<ImageItem> {
        let image = ImageReader::open(path).ok()?.decode().ok()?;
        let image = image.resize_exact(self.size, self.size, FilterType::Triangle);
        Some(ImageItem {
            image: normalize_channels_first(&image, self.channels),
        })
    }
}

fn readable_header(path: &Path) -> Result<()> {
    ImageReader::open(path)
        .map_err(GanError::from)
        .and_then(|reader| reader.into_dimensions().map_err(GanError::from))
        .map_err(|e| GanError::data(format!("cannot decode {}: {e}", path.display())))?;
    Ok(())
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn get(&self, index: usize) -> Option<ImageItem> {
        let path = self.image_paths.get(index)?;
        let item = self.decode(path);
        if item.is_none() {
            warn!("failed to decode {}, ending the pass early", path.display());
        }
        item
    }
}

/// Pixels of `image` as `[C, H, W]` floats in `[-1, 1]`.
pub fn normalize_channels_first(image: &DynamicImage, channels: usize) -> Vec<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; channels * plane];

    if channels == 1 {
        for (i, pixel) in image.to_luma8().pixels().enumerate() {
            data[i] = normalize(pixel[0]);
        }
    } else {
        for (i, pixel) in image.to_rgb8().pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = normalize(pixel[c]);
            }
        }
    }
    data
}

fn normalize(value: u8) -> f32 {
    value as f32 / 127.5 - 1.0
}

#[derive(Clone, Debug)]
pub struct ImageBatcher {
    channels: usize,
    size: usize,
}

impl ImageBatcher {
    pub fn new(channels: usize, size: usize) -> Self {
        Self { channels, size }
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>, // Shape: [batch_size, channels, height, width]
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let (channels, size) = (self.channels, self.size);
        let image_tensors: Vec<Tensor<B, 4>> = items
            .into_iter()
            .map(|item| {
                Tensor::<B, 3>::from_data(
                    TensorData::new(item.image, [channels, size, size]).convert::<B::FloatElem>(),
                    device,
                )
                .reshape([1, channels, size, size])
            })
            .collect();
        ImageBatch {
            images: Tensor::cat(image_tensors, 0),
        }
    }
}

/// Shuffled batches decoded by `num_workers` threads.
pub fn image_loader<B, D>(
    dataset: D,
    batcher: ImageBatcher,
    batch_size: usize,
    seed: u64,
    num_workers: usize,
) -> Arc<dyn DataLoader<B, ImageBatch<B>>>
where
    B: Backend,
    D: Dataset<ImageItem> + 'static,
{
    DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .shuffle(seed)
        .num_workers(num_workers)
        .build(dataset)
}

/// Endless stream of full batches over a data loader. Each pass is reshuffled
/// by the loader; a short final batch is skipped.
pub struct LoaderSource<'a, B: Backend> {
    loader: &'a dyn DataLoader<B, ImageBatch<B>>,
    batches: Box<dyn DataLoaderIterator<ImageBatch<B>> + 'a>,
}

impl<'a, B: Backend> LoaderSource<'a, B> {
    pub fn new(loader: &'a dyn DataLoader<B, ImageBatch<B>>) -> Self {
        Self {
            loader,
            batches: loader.iter(),
        }
    }
}

impl<B: Backend> ImageSource<B> for LoaderSource<'_, B> {
    fn next_batch(&mut self, batch_size: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
        for restart in [false, true] {
            if restart {
                debug!("data loader exhausted, starting a new pass");
                self.batches = self.loader.iter();
            }
            for batch in self.batches.by_ref() {
                if batch.images.dims()[0] == batch_size {
                    return Ok(batch.images.to_device(device));
                }
            }
        }
        Err(GanError::data(format!(
            "a full pass over {} images yields no batch of {batch_size}",
            self.loader.num_items()
        )))
    }
}

/// Split a `[N, C, H, W]` tensor into a dataset and the batcher that
/// reassembles it.
pub fn in_memory_dataset<B: Backend>(
    images: Tensor<B, 4>,
) -> Result<(InMemDataset<ImageItem>, ImageBatcher)> {
    let [count, channels, height, width] = images.dims();
    if height != width {
        return Err(GanError::data(format!(
            "in-memory images must be square, got {height}x{width}"
        )));
    }
    let values = images
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GanError::data(format!("cannot read image tensor: {e:?}")))?;
    let per_image = channels * height * width;
    let items = values
        .chunks(per_image)
        .take(count)
        .map(|image| ImageItem {
            image: image.to_vec(),
        })
        .collect();
    Ok((InMemDataset::new(items), ImageBatcher::new(channels, height)))
}
