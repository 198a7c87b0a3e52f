use std::path::Path;

use burn::tensor::{backend::AutodiffBackend, Device};
use image::{GrayImage, RgbImage};

use crate::{
    classifier::Classifier,
    error::Result,
    gradcam::GradCamConfig,
    input::load_image,
    overlay::{resize_heatmap, OverlayConfig},
    predict::{predict, Prediction},
};

/// Everything produced for a single image.
#[derive(Debug)]
pub struct Explanation {
    pub prediction: Prediction,
    /// Name of the explained layer.
    pub layer: String,
    /// 8-bit heatmap at the original image resolution.
    pub heatmap: GrayImage,
    /// Color-mapped heatmap.
    pub colored: RgbImage,
    /// Heatmap blended onto the original image.
    pub overlay: RgbImage,
}

/// Classify an image and explain the prediction.
///
/// Runs the image loader, the predictor, Grad-CAM on the predicted class and the overlay renderer
/// in sequence.
pub fn explain<B: AutodiffBackend>(
    classifier: &Classifier<B>,
    image_path: impl AsRef<Path>,
    gradcam: &GradCamConfig,
    overlay: &OverlayConfig,
    device: &Device<B>,
) -> Result<Explanation> {
    let [_, _, height, width] = classifier.input_shape();

    let (original, input) = load_image::<B>(image_path, width, height, device)?;

    // Untracked forward pass, the graph is dropped with the scores
    let prediction = predict(classifier, input.clone())?;

    let gradcam = gradcam.init(classifier)?;
    let heatmap = gradcam.compute_heatmap(input, prediction.class_index)?;

    // Back to the original image resolution
    let heatmap = resize_heatmap(&heatmap, original.width(), original.height());
    let (colored, overlay) = overlay.overlay(&heatmap, &original)?;

    Ok(Explanation {
        prediction,
        layer: gradcam.layer().to_string(),
        heatmap,
        colored,
        overlay,
    })
}
