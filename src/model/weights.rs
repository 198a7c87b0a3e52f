use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::PathBuf;

use burn::data::network::downloader;

use super::resnet::ResNetArch;
use crate::error::{GradCamError, Result};

/// Pre-trained weights metadata.
pub struct Weights {
    pub(super) url: &'static str,
    pub(super) num_classes: usize,
}

impl Weights {
    /// Download the pre-trained weights to the local cache directory.
    pub fn download(&self) -> Result<PathBuf> {
        // Model cache directory
        let model_dir = dirs::home_dir()
            .ok_or_else(|| {
                GradCamError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not locate the home directory",
                ))
            })?
            .join(".cache")
            .join("gradcam-burn");

        if !model_dir.exists() {
            create_dir_all(&model_dir)?;
        }

        let file_base_name = self
            .url
            .rsplit_once('/')
            .map_or(self.url, |(_, name)| name);
        let file_name = model_dir.join(file_base_name);
        if !file_name.exists() {
            log::info!("Downloading {} to {}", self.url, file_name.display());
            // Download file content
            let bytes = downloader::download_file_as_bytes(self.url, file_base_name);

            // Write content to file
            let mut output_file = File::create(&file_name)?;
            output_file.write_all(&bytes)?;
        }

        Ok(file_name)
    }
}

/// torchvision ImageNet-1k weights for the given depth.
///
/// These are the `IMAGENET1K_V1` weights, which reproduce closely the results of the original paper.
pub fn imagenet_weights(arch: ResNetArch) -> Weights {
    let url = match arch {
        // Top-1 accuracy: 69.758%
        ResNetArch::ResNet18 => "https://download.pytorch.org/models/resnet18-f37072fd.pth",
        // Top-1 accuracy: 73.314%
        ResNetArch::ResNet34 => "https://download.pytorch.org/models/resnet34-b627a593.pth",
        // Top-1 accuracy: 76.130%
        ResNetArch::ResNet50 => "https://download.pytorch.org/models/resnet50-0676ba61.pth",
        // Top-1 accuracy: 77.374%
        ResNetArch::ResNet101 => "https://download.pytorch.org/models/resnet101-63fe2227.pth",
        // Top-1 accuracy: 78.312%
        ResNetArch::ResNet152 => "https://download.pytorch.org/models/resnet152-394f9c45.pth",
    };

    Weights {
        url,
        num_classes: 1000,
    }
}
