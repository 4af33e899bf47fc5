use std::io::Cursor;

use candle_core::{Device, Tensor};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::Rng;

use crate::Result;

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(candle_core::Error::Msg(format!(
            "tensor_to_image expects an image with 3 channels, got {channels}"
        ))
        .into());
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::Msg("error converting tensor to image buffer".into()))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Draws i.i.d. standard-normal samples from a seeded host RNG.
///
/// The noise is generated on the host rather than through the device RNG so
/// that a given seed reproduces the same latent on every backend (candle's
/// CPU backend cannot be seeded).
pub fn randn(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    // Box-Muller transform for normal samples.
    let data: Vec<f32> = (0..count)
        .map(|_| {
            let u1: f64 = rng.random_range(f64::EPSILON..1.0);
            let u2: f64 = rng.random_range(0.0..1.0);
            ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
        })
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
