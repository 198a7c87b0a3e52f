use std::path::Path;

use burn::tensor::{backend::Backend, Device, Element, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};

use crate::{
    error::{GradCamError, Result},
    model::imagenet,
};

fn to_tensor<B: Backend, T: Element>(
    data: Vec<T>,
    shape: [usize; 3],
    device: &Device<B>,
) -> Tensor<B, 3> {
    Tensor::<B, 3>::from_data(TensorData::new(data, shape).convert::<B::FloatElem>(), device)
        .permute([2, 0, 1]) // [C, H, W]
        / 255 // normalize between [0, 1]
}

/// Convert an image to a normalized `[1, 3, height, width]` model input.
pub fn image_to_tensor<B: Backend>(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device<B>,
) -> Tensor<B, 4> {
    let resized_img = img.resize_exact(
        width as u32,
        height as u32,
        FilterType::Triangle, // also known as bilinear in 2D
    );

    let img_tensor = to_tensor(resized_img.into_rgb8().into_raw(), [height, width, 3], device)
        .unsqueeze::<4>(); // [B, C, H, W]

    imagenet::Normalizer::new(device).normalize(img_tensor)
}

/// Read an image file.
///
/// # Returns
///
/// The decoded RGB image at its native resolution and the normalized `[1, 3, height, width]`
/// model input.
pub fn load_image<B: Backend>(
    path: impl AsRef<Path>,
    width: usize,
    height: usize,
    device: &Device<B>,
) -> Result<(RgbImage, Tensor<B, 4>)> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| GradCamError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!(
        "Decoded {} ({}x{})",
        path.display(),
        img.width(),
        img.height()
    );

    let tensor = image_to_tensor(&img, width, height, device);

    Ok((img.into_rgb8(), tensor))
}
