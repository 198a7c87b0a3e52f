use core::{fmt, str::FromStr};

use burn::config::Config;
use colorous::Gradient;
use image::{imageops, GrayImage, ImageBuffer, Pixel, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{self, GradCamError};

/// Color map used to render a heatmap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    /// Perceptually uniform purple to yellow.
    #[default]
    Viridis,
    /// Improved rainbow, blue to red.
    Turbo,
    /// Black to light yellow through red.
    Inferno,
    /// Plain luminance.
    Gray,
}

impl Colormap {
    pub const ALL: [Colormap; 4] = [
        Colormap::Viridis,
        Colormap::Turbo,
        Colormap::Inferno,
        Colormap::Gray,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Colormap::Viridis => "viridis",
            Colormap::Turbo => "turbo",
            Colormap::Inferno => "inferno",
            Colormap::Gray => "gray",
        }
    }

    fn gradient(&self) -> Option<Gradient> {
        match self {
            Colormap::Viridis => Some(colorous::VIRIDIS),
            Colormap::Turbo => Some(colorous::TURBO),
            Colormap::Inferno => Some(colorous::INFERNO),
            Colormap::Gray => None,
        }
    }

    /// Color of an 8-bit intensity.
    pub fn map(&self, value: u8) -> Rgb<u8> {
        match self.gradient() {
            Some(gradient) => {
                let color = gradient.eval_continuous(value as f64 / 255.0);
                Rgb([color.r, color.g, color.b])
            }
            None => Rgb([value; 3]),
        }
    }

    /// Colorize a single channel heatmap.
    pub fn apply(&self, heatmap: &GrayImage) -> RgbImage {
        // One lookup per intensity level
        let lut: Vec<Rgb<u8>> = (0..=u8::MAX).map(|value| self.map(value)).collect();
        let (width, height) = heatmap.dimensions();
        ImageBuffer::from_fn(width, height, |x, y| {
            lut[heatmap.get_pixel(x, y)[0] as usize]
        })
    }
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl fmt::Display for Colormap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Colormap {
    type Err = GradCamError;

    fn from_str(s: &str) -> error::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|colormap| colormap.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| GradCamError::UnknownColormap(s.to_string()))
    }
}

/// Heatmap overlay configuration.
#[derive(Config, Debug)]
pub struct OverlayConfig {
    /// Weight of the original image in the blend, the heatmap gets `1 - alpha`.
    #[config(default = 0.5)]
    pub alpha: f32,
    #[config(default = "Colormap::Viridis")]
    pub colormap: Colormap,
}

impl OverlayConfig {
    /// Colorize the heatmap and blend it onto the image.
    ///
    /// # Arguments
    ///
    /// * `heatmap`: 8-bit heatmap, already resized to the image resolution.
    /// * `image`: Image to draw on.
    ///
    /// # Returns
    ///
    /// The colored heatmap and the blended image.
    pub fn overlay(
        &self,
        heatmap: &GrayImage,
        image: &RgbImage,
    ) -> error::Result<(RgbImage, RgbImage)> {
        overlay_heatmap(heatmap, image, self.alpha, self.colormap)
    }
}

/// Colorize the heatmap and blend it onto the image with
/// `output = alpha * image + (1 - alpha) * colored`.
pub fn overlay_heatmap(
    heatmap: &GrayImage,
    image: &RgbImage,
    alpha: f32,
    colormap: Colormap,
) -> error::Result<(RgbImage, RgbImage)> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(GradCamError::InvalidAlpha(alpha));
    }
    if heatmap.dimensions() != image.dimensions() {
        return Err(GradCamError::DimensionMismatch {
            heatmap: heatmap.dimensions(),
            image: image.dimensions(),
        });
    }

    let colored = colormap.apply(heatmap);
    let (width, height) = image.dimensions();
    let output = ImageBuffer::from_fn(width, height, |x, y| {
        image
            .get_pixel(x, y)
            .map2(colored.get_pixel(x, y), |pixel, heat| {
                to_u8(alpha * pixel as f32 + (1.0 - alpha) * heat as f32)
            })
    });

    Ok((colored, output))
}

/// Bilinear resize of a heatmap, e.g. to the resolution of the original image.
pub fn resize_heatmap(heatmap: &GrayImage, width: u32, height: u32) -> GrayImage {
    if heatmap.dimensions() == (width, height) {
        return heatmap.clone();
    }
    imageops::resize(heatmap, width, height, imageops::FilterType::Triangle)
}
