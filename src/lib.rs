pub mod classifier;
mod error;
pub mod gradcam;
pub mod input;
pub mod model;
pub mod overlay;
pub mod pipeline;
pub mod predict;

pub use classifier::{Classifier, ClassifierConfig};
pub use error::{GradCamError, Result};
pub use gradcam::{GradCam, GradCamConfig};
pub use overlay::{Colormap, OverlayConfig};
pub use pipeline::{explain, Explanation};
pub use predict::{predict, Prediction};
