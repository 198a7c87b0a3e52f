//! Gradient-weighted Class Activation Mapping.
//!
//! From [`Grad-CAM: Visual Explanations from Deep Networks via Gradient-based Localization`](https://arxiv.org/abs/1610.02391).

use burn::{
    config::Config,
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Tensor,
    },
};
use image::GrayImage;

use crate::{
    classifier::Classifier,
    error::{self, GradCamError},
    model::resnet::{Activation, LayerDescriptor, ResNet, Stage},
};

/// [Grad-CAM](GradCam) configuration.
#[derive(Config, Debug)]
pub struct GradCamConfig {
    /// Layer whose activations are explained. Defaults to the last layer with a 4D output.
    pub layer: Option<String>,
    /// Numerical stability constant of the heatmap normalization.
    #[config(default = 1e-8)]
    pub epsilon: f64,
}

impl GradCamConfig {
    /// Resolve the target layer of the classifier and initialize a [Grad-CAM](GradCam) engine.
    pub fn init<'a, B: AutodiffBackend>(
        &self,
        classifier: &'a Classifier<B>,
    ) -> error::Result<GradCam<'a, B>> {
        let name = resolve_target_layer(classifier.layers(), self.layer.as_deref())?;
        let stage =
            Stage::from_name(name).ok_or_else(|| GradCamError::UnknownLayer(name.to_string()))?;
        log::debug!("Grad-CAM target layer: {name}");

        Ok(GradCam {
            model: &classifier.model,
            stage,
            epsilon: self.epsilon as f32,
        })
    }
}

/// Find the layer to explain.
///
/// Without an explicit name, the layers are scanned from the output end and the last one with a 4D
/// `[B, C, H, W]` output wins. An explicit name must exist and have a 4D output.
pub fn resolve_target_layer<'a>(
    layers: &'a [LayerDescriptor],
    name: Option<&str>,
) -> error::Result<&'a str> {
    match name {
        Some(name) => {
            let layer = layers
                .iter()
                .find(|layer| layer.name == name)
                .ok_or_else(|| GradCamError::UnknownLayer(name.to_string()))?;
            if layer.rank() != 4 {
                return Err(GradCamError::NotSpatialLayer {
                    name: layer.name.clone(),
                    rank: layer.rank(),
                });
            }
            Ok(&layer.name)
        }
        None => layers
            .iter()
            .rev()
            .find(|layer| layer.rank() == 4)
            .map(|layer| layer.name.as_str())
            .ok_or(GradCamError::NoSpatialLayerFound),
    }
}

/// Grad-CAM engine bound to a model and a spatial target layer.
pub struct GradCam<'a, B: AutodiffBackend> {
    model: &'a ResNet<B>,
    stage: Stage,
    epsilon: f32,
}

impl<B: AutodiffBackend> GradCam<'_, B> {
    /// Name of the explained layer.
    pub fn layer(&self) -> &'static str {
        self.stage.name()
    }

    /// Compute the heatmap of the regions that drive the score of `class_index`.
    ///
    /// # Arguments
    ///
    /// * `input`: Normalized `[1, 3, H, W]` image tensor.
    /// * `class_index`: Class to explain.
    ///
    /// # Returns
    ///
    /// An 8-bit heatmap with the spatial resolution `[H, W]` of the input.
    pub fn compute_heatmap(
        &self,
        input: Tensor<B, 4>,
        class_index: usize,
    ) -> error::Result<GrayImage> {
        let num_classes = self.model.num_classes();
        if class_index >= num_classes {
            return Err(GradCamError::ClassIndexOutOfRange {
                index: class_index,
                num_classes,
            });
        }
        // Single RGB image
        let [batch_size, channels, height, width] = input.dims();
        if batch_size != 1 || channels != 3 {
            return Err(GradCamError::ShapeMismatch {
                expected: vec![1, 3, height, width],
                actual: input.dims().to_vec(),
            });
        }

        // Split the model at the target layer: activations, then class probabilities
        let activations = self
            .model
            .forward_until(input, self.stage)
            .into_spatial()
            .ok_or_else(|| GradCamError::NotSpatialLayer {
                name: self.layer().to_string(),
                rank: 2,
            })?
            .detach()
            .require_grad();
        let scores = self
            .model
            .forward_after(Activation::Spatial(activations.clone()), self.stage);
        let probabilities = softmax(scores, 1);

        // Gradient of the class probability w.r.t. the activations
        let score = probabilities
            .slice([0..1, class_index..class_index + 1])
            .sum();
        let grads = score.backward();
        let gradients = activations
            .grad(&grads)
            .ok_or_else(|| GradCamError::GradientUnavailable(self.layer().to_string()))?;

        let cam = class_activation_map(activations.inner(), gradients);
        let cam = resize_map(cam, height, width);

        let values: Vec<f32> = cam.into_data().iter().collect();
        GrayImage::from_raw(width as u32, height as u32, normalize_heatmap(&values, self.epsilon))
            .ok_or(GradCamError::ShapeMismatch {
                expected: vec![height, width],
                actual: vec![values.len()],
            })
    }
}

/// Weight the activation maps by their guided gradients.
///
/// # Arguments
///
/// * `activations`: Activations `[1, C, H, W]` of the target layer.
/// * `gradients`: Gradients `[1, C, H, W]` of the class score w.r.t. the activations.
///
/// # Returns
///
/// The class activation map `[H, W]`.
pub fn class_activation_map<B: Backend>(
    activations: Tensor<B, 4>,
    gradients: Tensor<B, 4>,
) -> Tensor<B, 2> {
    // Guided gradients, positive where both the activation and the gradient are positive
    let positive_activations = activations.clone().greater_elem(0.0).float();
    let positive_gradients = gradients.clone().greater_elem(0.0).float();
    let guided = positive_activations * positive_gradients * gradients;

    // Drop the batch dimension
    let activations: Tensor<B, 3> = activations.squeeze(0);
    let guided: Tensor<B, 3> = guided.squeeze(0);

    // One weight per channel [C, 1, 1]
    let weights = guided.mean_dim(2).mean_dim(1);

    // Weighted sum over the channels [C, H, W] -> [H, W]
    (activations * weights).sum_dim(0).squeeze(0)
}

/// Bilinear resize of a 2D map.
pub fn resize_map<B: Backend>(map: Tensor<B, 2>, height: usize, width: usize) -> Tensor<B, 2> {
    let [map_height, map_width] = map.dims();
    let map = map.reshape([1, 1, map_height, map_width]);

    interpolate(
        map,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
    .reshape([height, width])
}

/// Min-max scale raw activations to 8-bit intensities.
///
/// `epsilon` guards the division so a constant map yields zeros.
pub fn normalize_heatmap(values: &[f32], epsilon: f32) -> Vec<u8> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
            (min.min(v), max.max(v))
        });
    let denom = (max - min) + epsilon;

    values
        .iter()
        .map(|&v| ((v - min) / denom * 255.0) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::ClassifierConfig, model::resnet::ResNetArch};
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::Distribution,
    };

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn layer(name: &str, shape: &[usize]) -> LayerDescriptor {
        LayerDescriptor::new(name, shape.to_vec())
    }

    #[test]
    fn resolver_fails_without_spatial_layer() {
        let layers = [layer("dense", &[1, 128]), layer("logits", &[1, 10])];

        assert!(matches!(
            resolve_target_layer(&layers, None),
            Err(GradCamError::NoSpatialLayerFound)
        ));
        assert!(matches!(
            resolve_target_layer(&[], None),
            Err(GradCamError::NoSpatialLayerFound)
        ));
    }

    #[test]
    fn resolver_picks_the_last_spatial_layer() {
        let layers = [
            layer("conv", &[1, 8, 16, 16]),
            layer("pool", &[1, 8, 8, 8]),
            layer("flatten", &[1, 512]),
            layer("fc", &[1, 10]),
        ];

        assert_eq!(resolve_target_layer(&layers, None).unwrap(), "pool");
    }

    #[test]
    fn resolver_finds_a_single_spatial_layer_anywhere() {
        for position in 0..4 {
            let layers: Vec<_> = (0..4)
                .map(|i| {
                    if i == position {
                        layer(&format!("layer{i}"), &[1, 4, 7, 7])
                    } else {
                        layer(&format!("layer{i}"), &[1, 4])
                    }
                })
                .collect();

            assert_eq!(
                resolve_target_layer(&layers, None).unwrap(),
                format!("layer{position}")
            );
        }
    }

    #[test]
    fn resolver_validates_explicit_layers() {
        let layers = [layer("conv", &[1, 8, 16, 16]), layer("fc", &[1, 10])];

        assert_eq!(resolve_target_layer(&layers, Some("conv")).unwrap(), "conv");
        assert!(matches!(
            resolve_target_layer(&layers, Some("missing")),
            Err(GradCamError::UnknownLayer(name)) if name == "missing"
        ));
        assert!(matches!(
            resolve_target_layer(&layers, Some("fc")),
            Err(GradCamError::NotSpatialLayer { rank: 2, .. })
        ));
    }

    #[test]
    fn normalize_spans_the_full_range() {
        let heatmap = normalize_heatmap(&[0.0, 0.5, 1.0, 0.25], 1e-8);

        assert_eq!(heatmap, vec![0, 127, 255, 63]);
    }

    #[test]
    fn normalize_maps_the_maximum_to_the_top_of_the_range() {
        let values = [-3.2, 7.9, 0.4, 2.2, -1.0];

        let heatmap = normalize_heatmap(&values, 1e-8);

        assert_eq!(heatmap[0], 0);
        assert!(heatmap[1] >= 254, "{heatmap:?}");
    }

    #[test]
    fn normalize_constant_map_is_zero() {
        let heatmap = normalize_heatmap(&[4.2; 9], 1e-8);

        assert_eq!(heatmap, vec![0; 9]);
    }

    #[test]
    fn class_activation_map_uses_guided_gradients() {
        let device = Default::default();
        let activations = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 2.0], [3.0, 4.0]], [[-1.0, 1.0], [1.0, 1.0]]]],
            &device,
        );
        let gradients = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 1.0], [1.0, 1.0]], [[2.0, -2.0], [2.0, 2.0]]]],
            &device,
        );

        let cam: Vec<f32> = class_activation_map(activations, gradients)
            .into_data()
            .iter()
            .collect();

        // Channel weights are 1 and (0 + 0 + 2 + 2) / 4 = 1
        let expected = [0.0, 3.0, 4.0, 5.0];
        for (actual, expected) in cam.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-6, "{cam:?}");
        }
    }

    #[test]
    fn negative_evidence_is_suppressed() {
        let device = Default::default();
        let activations = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device);
        let gradients = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device).neg();

        let cam: Vec<f32> = class_activation_map(activations, gradients)
            .into_data()
            .iter()
            .collect();

        assert!(cam.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn resize_preserves_region_ordering() {
        let device = Default::default();
        // Hot bottom-right quadrant, cold top-left one
        let map = Tensor::<TestBackend, 2>::from_floats(
            [
                [0.0, 0.0, 1.0, 1.0],
                [0.0, 0.0, 1.0, 1.0],
                [1.0, 1.0, 5.0, 5.0],
                [1.0, 1.0, 5.0, 5.0],
            ],
            &device,
        );

        let resized = resize_map(map, 16, 16);

        assert_eq!(resized.dims(), [16, 16]);
        let values: Vec<f32> = resized.into_data().iter().collect();
        let quadrant_mean = |row: usize, col: usize| {
            let mut sum = 0.0;
            for y in row..row + 8 {
                for x in col..col + 8 {
                    sum += values[y * 16 + x];
                }
            }
            sum / 64.0
        };
        let cold = quadrant_mean(0, 0);
        let warm = quadrant_mean(0, 8);
        let hot = quadrant_mean(8, 8);
        assert!(cold < warm && warm < hot, "{cold} {warm} {hot}");
    }

    fn classifier() -> Classifier<TestAutodiffBackend> {
        let device = Default::default();
        let config = ClassifierConfig::new(ResNetArch::ResNet18, 3)
            .with_input_height(64)
            .with_input_width(64);
        let model = config.arch.init(config.num_classes, &device);

        Classifier::new(config, model, None, &device).unwrap()
    }

    #[test]
    fn default_target_is_the_last_residual_layer() {
        let classifier = classifier();

        let gradcam = GradCamConfig::new().init(&classifier).unwrap();

        assert_eq!(gradcam.layer(), "layer4");
    }

    #[test]
    fn heatmap_matches_the_input_resolution() {
        let device = Default::default();
        let classifier = classifier();
        let input = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 64, 64],
            Distribution::Default,
            &device,
        );

        for layer in ["layer3", "layer4"] {
            let gradcam = GradCamConfig::new()
                .with_layer(Some(layer.to_string()))
                .init(&classifier)
                .unwrap();

            let heatmap = gradcam.compute_heatmap(input.clone(), 1).unwrap();

            assert_eq!(heatmap.dimensions(), (64, 64));
        }
    }

    #[test]
    fn heatmap_rejects_batches() {
        let device = Default::default();
        let classifier = classifier();
        let gradcam = GradCamConfig::new().init(&classifier).unwrap();

        let result = gradcam.compute_heatmap(
            Tensor::random([2, 3, 64, 64], Distribution::Default, &device),
            0,
        );

        match result {
            Err(GradCamError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![1, 3, 64, 64]);
                assert_eq!(actual, vec![2, 3, 64, 64]);
            }
            other => panic!("Expected a shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn heatmap_depends_on_the_class() {
        let device = Default::default();
        let classifier = classifier();
        let gradcam = GradCamConfig::new()
            .with_layer(Some("layer3".to_string()))
            .init(&classifier)
            .unwrap();
        let input =
            Tensor::<TestAutodiffBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);

        let first = gradcam.compute_heatmap(input.clone(), 0).unwrap();
        let second = gradcam.compute_heatmap(input, 1).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn heatmap_follows_the_class_probability_gradient() {
        let device = Default::default();
        let classifier = classifier();
        let gradcam = GradCamConfig::new().init(&classifier).unwrap();
        let input =
            Tensor::<TestAutodiffBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
        let class_index = 2;

        let heatmap = gradcam.compute_heatmap(input.clone(), class_index).unwrap();

        // Same computation driven by hand on the split model
        let model = &classifier.model;
        let activations = model
            .forward_until(input, Stage::Layer4)
            .into_spatial()
            .unwrap()
            .detach()
            .require_grad();
        let scores = model.forward_after(Activation::Spatial(activations.clone()), Stage::Layer4);
        let grads = softmax(scores, 1)
            .slice([0..1, class_index..class_index + 1])
            .sum()
            .backward();
        let gradients = activations.grad(&grads).unwrap();
        let cam = resize_map(class_activation_map(activations.inner(), gradients), 64, 64);
        let values: Vec<f32> = cam.into_data().iter().collect();

        let epsilon = GradCamConfig::new().epsilon as f32;
        assert_eq!(heatmap.into_raw(), normalize_heatmap(&values, epsilon));
    }

    #[test]
    fn heatmap_rejects_unknown_classes() {
        let device = Default::default();
        let classifier = classifier();
        let gradcam = GradCamConfig::new().init(&classifier).unwrap();

        let result = gradcam.compute_heatmap(Tensor::zeros([1, 3, 64, 64], &device), 3);

        assert!(matches!(
            result,
            Err(GradCamError::ClassIndexOutOfRange {
                index: 3,
                num_classes: 3
            })
        ));
    }
}
