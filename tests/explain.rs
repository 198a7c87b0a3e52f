use std::{fs, path::PathBuf};

use burn::backend::{Autodiff, NdArray};
use gradcam_burn::{
    explain, input::load_image, model::resnet::ResNetArch, predict, Classifier, ClassifierConfig,
    Colormap, GradCamConfig, GradCamError, OverlayConfig,
};
use image::{ImageBuffer, Rgb, RgbImage};

type TestBackend = Autodiff<NdArray<f32>>;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "gradcam-burn-explain-{}-{name}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Save a small randomly initialized ResNet-18 with three labelled classes.
fn save_classifier(dir: &PathBuf) {
    let device = Default::default();
    let config = ClassifierConfig::new(ResNetArch::ResNet18, 3)
        .with_input_height(64)
        .with_input_width(64);
    let model = config.arch.init::<TestBackend>(config.num_classes, &device);
    let labels = vec!["apple".to_string(), "pear".to_string(), "plum".to_string()];

    Classifier::new(config, model, Some(labels), &device)
        .unwrap()
        .save(dir)
        .unwrap();
}

fn write_image(path: &PathBuf, width: u32, height: u32) {
    let image: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
        if x < width / 2 {
            Rgb([200, (y % 256) as u8, 30])
        } else {
            Rgb([20, 90, (x % 256) as u8])
        }
    });
    image.save(path).unwrap();
}

#[test]
fn explain_renders_at_original_resolution() {
    let device = Default::default();
    let dir = temp_dir("artifact");
    save_classifier(&dir);
    let image_path = dir.join("input.png");
    write_image(&image_path, 90, 70);

    let classifier = Classifier::<TestBackend>::load(&dir, &device).unwrap();
    let explanation = explain(
        &classifier,
        &image_path,
        &GradCamConfig::new(),
        &OverlayConfig::new(),
        &device,
    )
    .unwrap();

    assert_eq!(explanation.layer, "layer4");
    assert!(explanation.prediction.class_index < 3);
    assert!(explanation.prediction.label.is_some());
    assert_eq!(explanation.heatmap.dimensions(), (90, 70));
    assert_eq!(explanation.colored.dimensions(), (90, 70));
    assert_eq!(explanation.overlay.dimensions(), (90, 70));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn explain_is_deterministic() {
    let device = Default::default();
    let dir = temp_dir("deterministic");
    save_classifier(&dir);
    let image_path = dir.join("input.png");
    write_image(&image_path, 64, 64);

    let classifier = Classifier::<TestBackend>::load(&dir, &device).unwrap();
    let gradcam = GradCamConfig::new().with_layer(Some("layer3".to_string()));
    let overlay = OverlayConfig::new()
        .with_alpha(0.3)
        .with_colormap(Colormap::Turbo);

    let first = explain(&classifier, &image_path, &gradcam, &overlay, &device).unwrap();
    let second = explain(&classifier, &image_path, &gradcam, &overlay, &device).unwrap();

    assert_eq!(first.layer, "layer3");
    assert_eq!(first.prediction, second.prediction);
    assert_eq!(first.heatmap, second.heatmap);
    assert_eq!(first.overlay, second.overlay);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn explain_predicts_like_the_inference_backend() {
    let device = Default::default();
    let dir = temp_dir("inference");
    save_classifier(&dir);
    let image_path = dir.join("input.png");
    write_image(&image_path, 80, 48);

    let classifier = Classifier::<TestBackend>::load(&dir, &device).unwrap();
    let explanation = explain(
        &classifier,
        &image_path,
        &GradCamConfig::new(),
        &OverlayConfig::new(),
        &device,
    )
    .unwrap();

    let (_original, input) = load_image::<TestBackend>(&image_path, 64, 64, &device).unwrap();
    let expected = predict(&classifier.valid(), input.inner()).unwrap();

    assert_eq!(explanation.prediction.class_index, expected.class_index);
    assert_eq!(explanation.prediction.label, expected.label);
    assert!((explanation.prediction.percentage - expected.percentage).abs() < 1e-3);

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn explain_rejects_unknown_layer() {
    let device = Default::default();
    let dir = temp_dir("unknown-layer");
    save_classifier(&dir);
    let image_path = dir.join("input.png");
    write_image(&image_path, 64, 64);

    let classifier = Classifier::<TestBackend>::load(&dir, &device).unwrap();
    let gradcam = GradCamConfig::new().with_layer(Some("layer9".to_string()));

    let result = explain(
        &classifier,
        &image_path,
        &gradcam,
        &OverlayConfig::new(),
        &device,
    );

    assert!(matches!(result, Err(GradCamError::UnknownLayer(name)) if name == "layer9"));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn explain_reports_undecodable_image() {
    let device = Default::default();
    let dir = temp_dir("corrupt");
    save_classifier(&dir);
    let image_path = dir.join("input.png");
    fs::write(&image_path, b"not an image").unwrap();

    let classifier = Classifier::<TestBackend>::load(&dir, &device).unwrap();
    let result = explain(
        &classifier,
        &image_path,
        &GradCamConfig::new(),
        &OverlayConfig::new(),
        &device,
    );

    assert!(matches!(result, Err(GradCamError::ImageDecode { path, .. }) if path == image_path));
    fs::remove_dir_all(&dir).unwrap();
}
