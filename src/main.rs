use std::path::{Path, PathBuf};

use burn::{backend::Autodiff, tensor::Device};
use clap::{Args, Parser, Subcommand};
use gradcam_burn::{
    classifier::load_labels,
    explain,
    gradcam::resolve_target_layer,
    model::resnet::{ResNet, ResNetArch},
    Classifier, ClassifierConfig, Colormap, GradCamConfig, GradCamError, OverlayConfig, Result,
};
use image::RgbImage;

#[cfg(feature = "wgpu")]
type Inner = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
type Inner = burn::backend::NdArray;

type B = Autodiff<Inner>;

#[derive(Parser, Debug)]
#[command(version, about = "Grad-CAM explanations for ResNet image classifiers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify an image and render the Grad-CAM heatmap of the predicted class.
    Explain(ExplainArgs),
    /// List the layers of a model and the default Grad-CAM target.
    Layers {
        /// Model artifact directory.
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Build a model artifact directory from torchvision ResNet weights.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct ExplainArgs {
    /// Model artifact directory.
    #[arg(short, long)]
    model: PathBuf,

    /// Image to classify.
    #[arg(short, long)]
    image: PathBuf,

    /// Layer to explain, defaults to the last layer with a 4D output.
    #[arg(short, long)]
    layer: Option<String>,

    /// Weight of the original image in the overlay.
    #[arg(long, default_value_t = 0.5)]
    alpha: f32,

    /// Color map of the heatmap (viridis, turbo, inferno, gray).
    #[arg(long, default_value_t = Colormap::Viridis)]
    colormap: Colormap,

    /// Numerical stability constant of the heatmap normalization.
    #[arg(long, default_value_t = 1e-8)]
    epsilon: f64,

    /// Where to write the overlaid image.
    #[arg(short, long, default_value = "overlay.png")]
    output: PathBuf,

    /// Where to write the color-mapped heatmap.
    #[arg(long)]
    heatmap: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// ResNet depth (resnet18, resnet34, resnet50, resnet101, resnet152).
    #[arg(short, long, default_value_t = ResNetArch::ResNet18)]
    arch: ResNetArch,

    /// torchvision `state_dict` checkpoint (.pth).
    #[arg(short, long)]
    #[cfg_attr(feature = "pretrained", arg(required_unless_present = "pretrained"))]
    #[cfg_attr(not(feature = "pretrained"), arg(required = true))]
    weights: Option<PathBuf>,

    /// Download the torchvision ImageNet-1k weights instead.
    #[cfg(feature = "pretrained")]
    #[arg(long, conflicts_with = "weights")]
    pretrained: bool,

    /// Number of output classes of the checkpoint.
    #[arg(short, long, default_value_t = 1000)]
    num_classes: usize,

    /// Class labels, one per line.
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// Model input height.
    #[arg(long, default_value_t = 224)]
    height: usize,

    /// Model input width.
    #[arg(long, default_value_t = 224)]
    width: usize,

    /// Artifact directory to create.
    #[arg(short, long)]
    output: PathBuf,
}

fn save_rgb(image: &RgbImage, path: &Path) -> Result<()> {
    image.save(path).map_err(|source| GradCamError::ImageEncode {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

fn explain_command(args: ExplainArgs, device: &Device<B>) -> Result<()> {
    let classifier = Classifier::<B>::load(&args.model, device)?;

    let gradcam = GradCamConfig::new()
        .with_layer(args.layer)
        .with_epsilon(args.epsilon);
    let overlay = OverlayConfig::new()
        .with_alpha(args.alpha)
        .with_colormap(args.colormap);

    let explanation = explain(&classifier, &args.image, &gradcam, &overlay, device)?;

    println!("{}", explanation.prediction);
    println!("Explained layer: {}", explanation.layer);

    save_rgb(&explanation.overlay, &args.output)?;
    if let Some(path) = &args.heatmap {
        save_rgb(&explanation.colored, path)?;
    }

    Ok(())
}

fn layers_command(model: &Path, device: &Device<B>) -> Result<()> {
    let classifier = Classifier::<B>::load(model, device)?;

    for layer in classifier.layers() {
        println!("{:<10} {:?}", layer.name, layer.output_shape);
    }
    match resolve_target_layer(classifier.layers(), None) {
        Ok(name) => println!("Grad-CAM target: {name}"),
        Err(err) => println!("Grad-CAM target: none ({err})"),
    }

    Ok(())
}

fn export_command(args: ExportArgs, device: &Device<B>) -> Result<()> {
    #[cfg(feature = "pretrained")]
    let (model, num_classes) = if args.pretrained {
        let model = ResNet::<B>::pretrained(args.arch, device)?;
        let num_classes = model.num_classes();
        (model, num_classes)
    } else {
        load_torch_weights(&args, device)?
    };
    #[cfg(not(feature = "pretrained"))]
    let (model, num_classes) = load_torch_weights(&args, device)?;

    let labels = args.labels.as_ref().map(load_labels).transpose()?;
    let config = ClassifierConfig::new(args.arch, num_classes)
        .with_input_height(args.height)
        .with_input_width(args.width);

    Classifier::new(config, model, labels, device)?.save(&args.output)
}

fn load_torch_weights(args: &ExportArgs, device: &Device<B>) -> Result<(ResNet<B>, usize)> {
    let weights = args.weights.clone().ok_or_else(|| {
        GradCamError::Config("a checkpoint is required to export a model".to_string())
    })?;
    let model = ResNet::<B>::from_torch_weights(args.arch, weights, args.num_classes, device)?;

    Ok((model, args.num_classes))
}

fn run(cli: Cli) -> Result<()> {
    let device: Device<B> = Default::default();
    log::debug!("Running on {:?}", device);

    match cli.command {
        Command::Explain(args) => explain_command(args, &device),
        Command::Layers { model } => layers_command(&model, &device),
        Command::Export(args) => export_command(args, &device),
    }
}

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Cli::parse()) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

