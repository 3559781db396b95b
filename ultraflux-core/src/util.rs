use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, ErrorKind},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageFormat};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::warn;

use crate::DeviceMap;

/// Latent channels of the Flux autoencoder.
const LATENT_CHANNELS: usize = 16;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Cuda(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Metal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        requested => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!(
                %requested,
                "running on CPU, to run on GPU(metal), build with `--features metal`"
            );
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!(
                %requested,
                "running on CPU, to run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }
}

/// Draws the initial latent noise for an image of `height` x `width`.
///
/// The noise is sampled on the CPU from a seeded generator, so the same seed
/// yields the same latent on every device. Sizes are expected to be aligned
/// with `align_dimension`.
pub fn seeded_noise(
    seed: u64,
    height: usize,
    width: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let latent_h = height.div_ceil(16) * 2;
    let latent_w = width.div_ceil(16) * 2;
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..LATENT_CHANNELS * latent_h * latent_w)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    let noise = Tensor::from_vec(values, (1, LATENT_CHANNELS, latent_h, latent_w), &Device::Cpu)?;
    Ok(noise.to_device(device)?.to_dtype(dtype)?)
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Writes `image` as a JPEG named `{stem}.jpeg` inside `dir`.
///
/// If that name is already taken a numeric suffix is appended, so concurrent
/// writers never clobber each other. Returns the absolute path written.
pub fn save_jpeg(image: &DynamicImage, dir: &Path, stem: &str) -> Result<PathBuf> {
    let (path, file) = create_unique(dir, stem)?;
    encode_jpeg(image, file, &path)?;
    std::path::absolute(&path).with_context(|| format!("failed to resolve {}", path.display()))
}

/// Writes `image` as a JPEG at `path`, replacing any existing file.
pub fn write_jpeg(image: &DynamicImage, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    encode_jpeg(image, file, path)
}

fn encode_jpeg(image: &DynamicImage, file: File, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(file);
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut writer, ImageFormat::Jpeg)
        .with_context(|| format!("failed to encode {}", path.display()))
}

fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    for attempt in 0u32.. {
        let name = match attempt {
            0 => format!("{stem}.jpeg"),
            n => format!("{stem}_{n}.jpeg"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", path.display()))
            }
        }
    }
    unreachable!("exhausted file name suffixes")
}
