use core::{f64::consts::SQRT_2, fmt, str::FromStr};

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Device, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};

use super::block::{frozen_batch_norm, LayerBlock, LayerBlockConfig};
use crate::error::{GradCamError, Result};

// ResNet residual layer block configs
const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];
const RESNET152_BLOCKS: [usize; 4] = [3, 8, 36, 3];

/// Supported ResNet depths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResNetArch {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl ResNetArch {
    pub const ALL: [ResNetArch; 5] = [
        ResNetArch::ResNet18,
        ResNetArch::ResNet34,
        ResNetArch::ResNet50,
        ResNetArch::ResNet101,
        ResNetArch::ResNet152,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResNetArch::ResNet18 => "resnet18",
            ResNetArch::ResNet34 => "resnet34",
            ResNetArch::ResNet50 => "resnet50",
            ResNetArch::ResNet101 => "resnet101",
            ResNetArch::ResNet152 => "resnet152",
        }
    }

    /// Initialize a randomly weighted model of this depth.
    pub fn init<B: Backend>(&self, num_classes: usize, device: &Device<B>) -> ResNet<B> {
        match self {
            ResNetArch::ResNet18 => ResNet::resnet18(num_classes, device),
            ResNetArch::ResNet34 => ResNet::resnet34(num_classes, device),
            ResNetArch::ResNet50 => ResNet::resnet50(num_classes, device),
            ResNetArch::ResNet101 => ResNet::resnet101(num_classes, device),
            ResNetArch::ResNet152 => ResNet::resnet152(num_classes, device),
        }
    }
}

impl fmt::Display for ResNetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResNetArch {
    type Err = GradCamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|arch| arch.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| GradCamError::UnknownArch(s.to_string()))
    }
}

/// Named stages of the [ResNet](ResNet) forward pass, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Conv1,
    Bn1,
    Relu,
    MaxPool,
    Layer1,
    Layer2,
    Layer3,
    Layer4,
    /// Global average pooling, flattened to `[B, C]`.
    AvgPool,
    Fc,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Conv1,
        Stage::Bn1,
        Stage::Relu,
        Stage::MaxPool,
        Stage::Layer1,
        Stage::Layer2,
        Stage::Layer3,
        Stage::Layer4,
        Stage::AvgPool,
        Stage::Fc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Conv1 => "conv1",
            Stage::Bn1 => "bn1",
            Stage::Relu => "relu",
            Stage::MaxPool => "maxpool",
            Stage::Layer1 => "layer1",
            Stage::Layer2 => "layer2",
            Stage::Layer3 => "layer3",
            Stage::Layer4 => "layer4",
            Stage::AvgPool => "avgpool",
            Stage::Fc => "fc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.name() == name)
    }

    /// Index of the stage in [execution order](Stage::ALL).
    fn position(&self) -> usize {
        *self as usize
    }
}

/// Output of a single [stage](Stage).
#[derive(Clone, Debug)]
pub(crate) enum Activation<B: Backend> {
    /// Feature maps `[B, C, H, W]`.
    Spatial(Tensor<B, 4>),
    /// Pooled features or class scores `[B, N]`.
    Flat(Tensor<B, 2>),
}

impl<B: Backend> Activation<B> {
    pub(crate) fn dims(&self) -> Vec<usize> {
        match self {
            Activation::Spatial(x) => x.dims().to_vec(),
            Activation::Flat(x) => x.dims().to_vec(),
        }
    }

    pub(crate) fn into_spatial(self) -> Option<Tensor<B, 4>> {
        match self {
            Activation::Spatial(x) => Some(x),
            Activation::Flat(_) => None,
        }
    }
}

/// Name and output shape of a model layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub name: String,
    pub output_shape: Vec<usize>,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, output_shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            output_shape,
        }
    }

    /// Number of output dimensions, including the batch dimension.
    pub fn rank(&self) -> usize {
        self.output_shape.len()
    }
}

/// ResNet implementation.
/// Derived from [torchivision.models.resnet.ResNet](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py)
///
/// Batch normalization always uses the running statistics so that the model behaves the same on
/// an autodiff backend as on its inner backend.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        // First block
        let out = self.conv1.forward(input);
        let out = frozen_batch_norm(&self.bn1, out);
        let out = self.relu.forward(out);
        let out = self.maxpool.forward(out);

        // Residual blocks
        let out = self.layer1.forward(out);
        let out = self.layer2.forward(out);
        let out = self.layer3.forward(out);
        let out = self.layer4.forward(out);

        let out = self.avgpool.forward(out);
        // Reshape [B, C, 1, 1] -> [B, C]
        let out = out.flatten(1, 3);

        self.fc.forward(out)
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        let [_d_input, d_output] = self.fc.weight.dims();
        d_output
    }

    /// Run a single stage.
    ///
    /// # Panics
    ///
    /// If the activation rank does not match the stage, which cannot happen when the stages are
    /// chained in [execution order](Stage::ALL) from an image batch.
    fn forward_stage(&self, stage: Stage, x: Activation<B>) -> Activation<B> {
        use Activation::{Flat, Spatial};

        match (stage, x) {
            (Stage::Conv1, Spatial(x)) => Spatial(self.conv1.forward(x)),
            (Stage::Bn1, Spatial(x)) => Spatial(frozen_batch_norm(&self.bn1, x)),
            (Stage::Relu, Spatial(x)) => Spatial(self.relu.forward(x)),
            (Stage::MaxPool, Spatial(x)) => Spatial(self.maxpool.forward(x)),
            (Stage::Layer1, Spatial(x)) => Spatial(self.layer1.forward(x)),
            (Stage::Layer2, Spatial(x)) => Spatial(self.layer2.forward(x)),
            (Stage::Layer3, Spatial(x)) => Spatial(self.layer3.forward(x)),
            (Stage::Layer4, Spatial(x)) => Spatial(self.layer4.forward(x)),
            (Stage::AvgPool, Spatial(x)) => Flat(self.avgpool.forward(x).flatten(1, 3)),
            (Stage::Fc, Flat(x)) => Flat(self.fc.forward(x)),
            (stage, x) => panic!(
                "Stage {} cannot take a {}D input",
                stage.name(),
                x.dims().len()
            ),
        }
    }

    /// Forward the input through every stage up to and including `target`.
    pub(crate) fn forward_until(&self, input: Tensor<B, 4>, target: Stage) -> Activation<B> {
        Stage::ALL[..=target.position()]
            .iter()
            .fold(Activation::Spatial(input), |x, &stage| {
                self.forward_stage(stage, x)
            })
    }

    /// Forward the output of `target` through the remaining stages to the class scores.
    pub(crate) fn forward_after(&self, x: Activation<B>, target: Stage) -> Tensor<B, 2> {
        let out = Stage::ALL[target.position() + 1..]
            .iter()
            .fold(x, |x, &stage| self.forward_stage(stage, x));

        match out {
            Activation::Flat(scores) => scores,
            Activation::Spatial(_) => unreachable!("the last stage always outputs class scores"),
        }
    }

    /// Describe the stages by tracing a zero input of the given shape.
    pub fn layers(&self, input_shape: [usize; 4], device: &Device<B>) -> Vec<LayerDescriptor> {
        let mut x = Activation::Spatial(Tensor::zeros(input_shape, device));
        let mut layers = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            x = self.forward_stage(stage, x);
            log::debug!("Layer {} output shape {:?}", stage.name(), x.dims());
            layers.push(LayerDescriptor::new(stage.name(), x.dims()));
        }

        layers
    }

    /// ResNet-18 from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385).
    ///
    /// # Arguments
    ///
    /// * `num_classes`: Number of output classes of the model.
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// A ResNet-18 module.
    pub fn resnet18(num_classes: usize, device: &Device<B>) -> Self {
        ResNetConfig::new(RESNET18_BLOCKS, num_classes, 1).init(device)
    }

    /// ResNet-34 from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385).
    pub fn resnet34(num_classes: usize, device: &Device<B>) -> Self {
        ResNetConfig::new(RESNET34_BLOCKS, num_classes, 1).init(device)
    }

    /// ResNet-50 from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385).
    pub fn resnet50(num_classes: usize, device: &Device<B>) -> Self {
        ResNetConfig::new(RESNET50_BLOCKS, num_classes, 4).init(device)
    }

    /// ResNet-101 from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385).
    pub fn resnet101(num_classes: usize, device: &Device<B>) -> Self {
        ResNetConfig::new(RESNET101_BLOCKS, num_classes, 4).init(device)
    }

    /// ResNet-152 from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385).
    pub fn resnet152(num_classes: usize, device: &Device<B>) -> Self {
        ResNetConfig::new(RESNET152_BLOCKS, num_classes, 4).init(device)
    }

    /// Load a torchvision ResNet `state_dict` checkpoint.
    ///
    /// # Arguments
    ///
    /// * `arch`: Depth of the checkpoint's network.
    /// * `torch_weights`: Path to the `.pth` file.
    /// * `num_classes`: Number of output classes of the checkpoint.
    /// * `device` - Device to create the module on.
    pub fn from_torch_weights(
        arch: ResNetArch,
        torch_weights: impl Into<std::path::PathBuf>,
        num_classes: usize,
        device: &Device<B>,
    ) -> Result<Self> {
        let load_args = LoadArgs::new(torch_weights.into())
            // Map *.downsample.0.* -> *.downsample.conv.*
            .with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
            // Map *.downsample.1.* -> *.downsample.bn.*
            .with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2")
            // Map layer[i].[j].* -> layer[i].blocks.[j].*
            .with_key_remap("(layer[1-4])\\.([0-9]+)\\.(.+)", "$1.blocks.$2.$3");
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::new()
            .load(load_args, device)
            .map_err(|err| GradCamError::Record(format!("Failed to load torch weights: {err}")))?;

        Ok(arch.init(num_classes, device).load_record(record))
    }
}

#[cfg(feature = "pretrained")]
impl<B: Backend> ResNet<B> {
    /// ResNet from [`Deep Residual Learning for Image Recognition`](https://arxiv.org/abs/1512.03385)
    /// with the torchvision ImageNet-1k pre-trained weights.
    ///
    /// # Arguments
    ///
    /// * `arch`: Depth of the network.
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// A ResNet module with pre-trained weights.
    pub fn pretrained(arch: ResNetArch, device: &Device<B>) -> Result<Self> {
        let weights = super::weights::imagenet_weights(arch);
        let torch_weights = weights.download()?;

        Self::from_torch_weights(arch, torch_weights, weights.num_classes, device)
    }
}

/// [ResNet](ResNet) configuration.
struct ResNetConfig {
    conv1: Conv2dConfig,
    bn1: BatchNormConfig,
    maxpool: MaxPool2dConfig,
    layer1: LayerBlockConfig,
    layer2: LayerBlockConfig,
    layer3: LayerBlockConfig,
    layer4: LayerBlockConfig,
    avgpool: AdaptiveAvgPool2dConfig,
    fc: LinearConfig,
}

impl ResNetConfig {
    /// Create a new instance of the ResNet [config](ResNetConfig).
    fn new(blocks: [usize; 4], num_classes: usize, expansion: usize) -> Self {
        // `new()` is private but still check just in case...
        assert!(
            expansion == 1 || expansion == 4,
            "ResNet module only supports expansion values [1, 4] for residual blocks"
        );

        // 7x7 conv, 64, /2
        let conv1 = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false);
        let bn1 = BatchNormConfig::new(64);

        // 3x3 maxpool, /2
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1));

        // Residual blocks
        let bottleneck = expansion > 1;
        let layer1 = LayerBlockConfig::new(blocks[0], 64, 64 * expansion, 1, bottleneck);
        let layer2 =
            LayerBlockConfig::new(blocks[1], 64 * expansion, 128 * expansion, 2, bottleneck);
        let layer3 =
            LayerBlockConfig::new(blocks[2], 128 * expansion, 256 * expansion, 2, bottleneck);
        let layer4 =
            LayerBlockConfig::new(blocks[3], 256 * expansion, 512 * expansion, 2, bottleneck);

        // Average pooling [B, 512 * expansion, H, W] -> [B, 512 * expansion, 1, 1]
        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]);

        // Output layer
        let fc = LinearConfig::new(512 * expansion, num_classes);

        Self {
            conv1,
            bn1,
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool,
            fc,
        }
    }

    /// Initialize a new [ResNet](ResNet) module.
    fn init<B: Backend>(self, device: &Device<B>) -> ResNet<B> {
        // Conv initializer
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2, // recommended value for ReLU
            fan_out_only: true,
        };

        ResNet {
            conv1: self.conv1.with_initializer(initializer).init(device),
            bn1: self.bn1.init(device),
            relu: Relu::new(),
            maxpool: self.maxpool.init(),
            layer1: self.layer1.init(device),
            layer2: self.layer2.init(device),
            layer3: self.layer3.init(device),
            layer4: self.layer4.init(device),
            avgpool: self.avgpool.init(),
            fc: self.fc.init(device),
        }
    }
}
