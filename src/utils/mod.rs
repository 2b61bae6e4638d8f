use std::path::Path;

use burn::prelude::*;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::error::{GanError, Result};

/// Reverse the `[-1, 1]` normalisation: `(val + 1) * 127.5`, clamped to a byte.
pub fn denormalize(val: f32) -> u8 {
    ((val + 1.0) * 127.5).clamp(0.0, 255.0) as u8
}

/// Side of the largest square grid that fits `count` images.
pub fn grid_side(count: usize) -> usize {
    (count as f64).sqrt().floor() as usize
}

/// Tile `[N, H, W, C]` images row-major into one `rows x cols` canvas.
///
/// Channel counts other than 1, 3 and 4 are rejected, as are batches with
/// more images than cells. Unused cells stay black.
pub fn assemble_grid(
    images: &[f32],
    shape: [usize; 4],
    rows: usize,
    cols: usize,
) -> Result<DynamicImage> {
    let [count, height, width, channels] = shape;
    if !matches!(channels, 1 | 3 | 4) {
        return Err(GanError::invalid_image(format!(
            "images must have 1, 3 or 4 channels, got {channels}"
        )));
    }
    if count > rows * cols {
        return Err(GanError::invalid_image(format!(
            "{count} images do not fit a {rows}x{cols} grid"
        )));
    }
    if images.len() != count * height * width * channels {
        return Err(GanError::invalid_image(format!(
            "expected {} values for shape {shape:?}, got {}",
            count * height * width * channels,
            images.len()
        )));
    }

    let canvas_width = width * cols;
    let canvas_height = height * rows;
    let mut pixels = vec![0u8; canvas_width * canvas_height * channels];
    let image_len = height * width * channels;
    let row_len = width * channels;

    for (idx, image) in images.chunks(image_len).enumerate() {
        let i = idx % cols;
        let j = idx / cols;
        for y in 0..height {
            let src = &image[y * row_len..(y + 1) * row_len];
            let offset = ((j * height + y) * canvas_width + i * width) * channels;
            for (dst, &val) in pixels[offset..offset + row_len].iter_mut().zip(src) {
                *dst = denormalize(val);
            }
        }
    }

    let (w, h) = (canvas_width as u32, canvas_height as u32);
    let canvas = match channels {
        1 => GrayImage::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
        _ => RgbaImage::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
    };
    canvas.ok_or_else(|| GanError::invalid_image("canvas buffer does not match its size"))
}

/// `[N, C, H, W]` tensor to `[N, H, W, C]` values.
pub fn tensor_to_nhwc<B: Backend>(images: Tensor<B, 4>) -> Result<(Vec<f32>, [usize; 4])> {
    let [n, c, h, w] = images.dims();
    let values = images
        .permute([0, 2, 3, 1])
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GanError::invalid_image(format!("cannot read image tensor: {e:?}")))?;
    Ok((values, [n, h, w, c]))
}

/// Write a `[N, C, H, W]` batch as one grid image.
pub fn save_grid<B: Backend>(
    images: Tensor<B, 4>,
    rows: usize,
    cols: usize,
    path: &Path,
) -> Result<()> {
    let (values, shape) = tensor_to_nhwc(images)?;
    assemble_grid(&values, shape, rows, cols)?.save(path)?;
    Ok(())
}
