use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradCamError {
    #[error("Could not find a 4D layer, cannot apply Grad-CAM")]
    NoSpatialLayerFound,

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Layer {name} has a {rank}D output, Grad-CAM needs a 4D feature map")]
    NotSpatialLayer { name: String, rank: usize },

    #[error("Failed to decode image {}: {source}", .path.display())]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to encode image {}: {source}", .path.display())]
    ImageEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Input shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Class index {index} is out of range for {num_classes} classes")]
    ClassIndexOutOfRange { index: usize, num_classes: usize },

    #[error("Heatmap dimensions {heatmap:?} do not match image dimensions {image:?}")]
    DimensionMismatch {
        heatmap: (u32, u32),
        image: (u32, u32),
    },

    #[error("Blend factor must lie in [0, 1], got {0}")]
    InvalidAlpha(f32),

    #[error("Unknown colormap: {0}")]
    UnknownColormap(String),

    #[error("Unknown architecture: {0}")]
    UnknownArch(String),

    #[error("Model artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("Invalid model config: {0}")]
    Config(String),

    #[error("Weights error: {0}")]
    Record(String),

    #[error("Label file has {actual} labels but the model has {expected} classes")]
    LabelCount { expected: usize, actual: usize },

    #[error("No gradient reached layer {0}")]
    GradientUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GradCamError>;
