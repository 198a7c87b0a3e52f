use std::{fs, path::Path};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Device,
    },
};

use crate::{
    error::{self, GradCamError},
    model::resnet::{LayerDescriptor, ResNet, ResNetArch},
};

const CONFIG_FILE: &str = "config.json";
/// Weights file stem, the recorder adds the `.mpk` extension.
const WEIGHTS_FILE: &str = "model";
const LABELS_FILE: &str = "labels.txt";

/// Architecture and input geometry of a saved classifier.
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub arch: ResNetArch,
    pub num_classes: usize,
    #[config(default = 224)]
    pub input_height: usize,
    #[config(default = 224)]
    pub input_width: usize,
}

impl ClassifierConfig {
    /// Shape of the single-image batch the model expects, `[1, 3, H, W]`.
    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.input_height, self.input_width]
    }
}

/// A classifier loaded from an artifact directory.
///
/// The directory holds `config.json`, the `model.mpk` weights and an optional `labels.txt` with one
/// class label per line.
#[derive(Debug)]
pub struct Classifier<B: Backend> {
    pub config: ClassifierConfig,
    pub model: ResNet<B>,
    pub labels: Option<Vec<String>>,
    layers: Vec<LayerDescriptor>,
}

impl<B: Backend> Classifier<B> {
    pub fn new(
        config: ClassifierConfig,
        model: ResNet<B>,
        labels: Option<Vec<String>>,
        device: &Device<B>,
    ) -> error::Result<Self> {
        if model.num_classes() != config.num_classes {
            return Err(GradCamError::Config(format!(
                "model outputs {} classes, config declares {}",
                model.num_classes(),
                config.num_classes
            )));
        }
        if let Some(labels) = &labels {
            if labels.len() != config.num_classes {
                return Err(GradCamError::LabelCount {
                    expected: config.num_classes,
                    actual: labels.len(),
                });
            }
        }

        let layers = model.layers(config.input_shape(), device);

        Ok(Self {
            config,
            model,
            labels,
            layers,
        })
    }

    /// Load a classifier from an artifact directory.
    pub fn load(dir: impl AsRef<Path>, device: &Device<B>) -> error::Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(GradCamError::ArtifactNotFound(dir.to_path_buf()));
        }

        let config_path = dir.join(CONFIG_FILE);
        let config = ClassifierConfig::load(&config_path)
            .map_err(|err| GradCamError::Config(format!("{}: {err}", config_path.display())))?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let model = config
            .arch
            .init::<B>(config.num_classes, device)
            .load_file(dir.join(WEIGHTS_FILE), &recorder, device)
            .map_err(|err| {
                GradCamError::Record(format!(
                    "Failed to load weights from {}.\nError: {err}",
                    dir.display()
                ))
            })?;

        let labels = read_labels(&dir.join(LABELS_FILE))?;
        log::info!(
            "Loaded {} with {} classes from {}",
            config.arch,
            config.num_classes,
            dir.display()
        );

        Self::new(config, model, labels, device)
    }

    /// Save the classifier as an artifact directory.
    pub fn save(&self, dir: impl AsRef<Path>) -> error::Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        self.config.save(dir.join(CONFIG_FILE))?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model
            .clone() // `save_file` takes ownership
            .save_file(dir.join(WEIGHTS_FILE), &recorder)
            .map_err(|err| {
                GradCamError::Record(format!(
                    "Failed to save weights to {}.\nError: {err}",
                    dir.display()
                ))
            })?;

        if let Some(labels) = &self.labels {
            let mut content = labels.join("\n");
            content.push('\n');
            fs::write(dir.join(LABELS_FILE), content)?;
        }

        log::info!("Saved {} to {}", self.config.arch, dir.display());
        Ok(())
    }

    /// Layer descriptors in execution order, traced at load time.
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.config.input_shape()
    }

    /// Label of a class, when the artifact ships a label file.
    pub fn label(&self, class_index: usize) -> Option<&str> {
        self.labels
            .as_ref()
            .and_then(|labels| labels.get(class_index))
            .map(String::as_str)
    }
}

impl<B: AutodiffBackend> Classifier<B> {
    /// The same classifier on the inner backend, without gradient tracking.
    pub fn valid(&self) -> Classifier<B::InnerBackend> {
        Classifier {
            config: self.config.clone(),
            model: self.model.valid(),
            labels: self.labels.clone(),
            layers: self.layers.clone(),
        }
    }
}

fn read_labels(path: &Path) -> error::Result<Option<Vec<String>>> {
    if !path.exists() {
        return Ok(None);
    }

    let labels = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    Ok(Some(labels))
}

/// Read a label file, one label per line.
pub fn load_labels(path: impl AsRef<Path>) -> error::Result<Vec<String>> {
    let path = path.as_ref();
    read_labels(path)?.ok_or_else(|| {
        GradCamError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Label file {} not found", path.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gradcam-burn-classifier-{}-{name}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn label_count_must_match_classes() {
        let device = Default::default();
        let config = ClassifierConfig::new(ResNetArch::ResNet18, 3)
            .with_input_height(32)
            .with_input_width(32);
        let model = config.arch.init::<TestBackend>(3, &device);

        let result = Classifier::new(config, model, Some(vec!["cat".into()]), &device);

        assert!(matches!(
            result,
            Err(GradCamError::LabelCount {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn load_missing_directory_fails() {
        let device = Default::default();
        let dir = temp_dir("missing");

        let result = Classifier::<TestBackend>::load(&dir, &device);

        assert!(matches!(result, Err(GradCamError::ArtifactNotFound(path)) if path == dir));
    }

    #[test]
    fn load_without_config_fails() {
        let device = Default::default();
        let dir = temp_dir("no-config");
        fs::create_dir_all(&dir).unwrap();

        let result = Classifier::<TestBackend>::load(&dir, &device);

        assert!(matches!(result, Err(GradCamError::Config(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn config_file_keeps_the_input_geometry() {
        let dir = temp_dir("config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        let config = ClassifierConfig::new(ResNetArch::ResNet50, 10).with_input_width(160);

        config.save(&path).unwrap();
        let loaded = ClassifierConfig::load(&path).unwrap();

        assert_eq!(loaded.arch, ResNetArch::ResNet50);
        assert_eq!(loaded.input_shape(), [1, 3, 224, 160]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn read_labels_skips_blank_lines() {
        let dir = temp_dir("labels");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(LABELS_FILE);
        fs::write(&path, "cat\n  dog \n\nbird\n").unwrap();

        let labels = load_labels(&path).unwrap();

        assert_eq!(labels, vec!["cat", "dog", "bird"]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
