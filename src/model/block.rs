use core::f64::consts::SQRT_2;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Device, Tensor},
};

/// Batch normalization with the running statistics.
///
/// [BatchNorm] normalizes with the batch statistics whenever the backend tracks gradients, but an
/// explanation must differentiate the network exactly as it predicts.
pub(crate) fn frozen_batch_norm<B: Backend>(bn: &BatchNorm<B, 2>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [channels] = bn.gamma.val().dims();
    let shape = [1, channels, 1, 1];

    let mean = bn.running_mean.value().reshape(shape);
    let std = bn.running_var.value().add_scalar(bn.epsilon).sqrt().reshape(shape);
    let gamma = bn.gamma.val().reshape(shape);
    let beta = bn.beta.val().reshape(shape);

    (x - mean) / std * gamma + beta
}

fn conv_initializer() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2, // recommended value for ReLU
        fan_out_only: true,
    }
}

/// ResNet basic residual block implementation.
/// Derived from [torchivision.models.resnet.BasicBlock](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py)
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Conv block
        let out = self.conv1.forward(input);
        let out = frozen_batch_norm(&self.bn1, out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = frozen_batch_norm(&self.bn2, out);

        // Skip connection
        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }
}

/// ResNet bottleneck residual block implementation.
/// Derived from [torchivision.models.resnet.Bottleneck](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py)
///
/// **NOTE:** Following common practice, this bottleneck block places the stride for downsampling
/// on the second 3x3 convolution while the original paper places it on the first 1x1 convolution.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Conv block
        let out = self.conv1.forward(input);
        let out = frozen_batch_norm(&self.bn1, out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = frozen_batch_norm(&self.bn2, out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = frozen_batch_norm(&self.bn3, out);

        // Skip connection
        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }
}

/// Downsample layer applies a 1x1 conv to reduce the resolution [H, W] and adjust the number of channels.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        frozen_batch_norm(&self.bn, out)
    }
}

/// Either residual block flavor, so a [LayerBlock] can hold both.
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for block in &self.blocks {
            out = block.forward(out);
        }
        out
    }
}

/// [Downsample](Downsample) configuration.
struct DownsampleConfig {
    conv: Conv2dConfig,
    bn: BatchNormConfig,
}

impl DownsampleConfig {
    fn new(in_channels: usize, out_channels: usize, stride: usize) -> Self {
        // conv1x1 (default padding = valid)
        let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(0, 0))
            .with_bias(false);
        let bn = BatchNormConfig::new(out_channels);

        Self { conv, bn }
    }

    fn init<B: Backend>(&self, device: &Device<B>) -> Downsample<B> {
        Downsample {
            conv: self.conv.clone().with_initializer(conv_initializer()).init(device),
            bn: self.bn.init(device),
        }
    }
}

/// Residual block configuration, either [basic](BasicBlock) or [bottleneck](Bottleneck).
struct ResidualBlockConfig {
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    bottleneck: bool,
}

impl ResidualBlockConfig {
    fn downsample(&self) -> Option<DownsampleConfig> {
        if self.stride != 1 || self.in_channels != self.out_channels {
            Some(DownsampleConfig::new(
                self.in_channels,
                self.out_channels,
                self.stride,
            ))
        } else {
            None
        }
    }

    fn conv(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Conv2dConfig {
        let padding = kernel / 2;
        Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .with_initializer(conv_initializer())
    }

    fn init<B: Backend>(&self, device: &Device<B>) -> ResidualBlock<B> {
        let downsample = self.downsample().map(|config| config.init(device));

        if self.bottleneck {
            // Bottleneck width is a quarter of the expanded output channels
            let width = self.out_channels / 4;
            ResidualBlock::Bottleneck(Bottleneck {
                conv1: Self::conv(self.in_channels, width, 1, 1).init(device),
                bn1: BatchNormConfig::new(width).init(device),
                relu: Relu::new(),
                conv2: Self::conv(width, width, 3, self.stride).init(device),
                bn2: BatchNormConfig::new(width).init(device),
                conv3: Self::conv(width, self.out_channels, 1, 1).init(device),
                bn3: BatchNormConfig::new(self.out_channels).init(device),
                downsample,
            })
        } else {
            ResidualBlock::Basic(BasicBlock {
                conv1: Self::conv(self.in_channels, self.out_channels, 3, self.stride).init(device),
                bn1: BatchNormConfig::new(self.out_channels).init(device),
                relu: Relu::new(),
                conv2: Self::conv(self.out_channels, self.out_channels, 3, 1).init(device),
                bn2: BatchNormConfig::new(self.out_channels).init(device),
                downsample,
            })
        }
    }
}

/// [Residual layer block](LayerBlock) configuration.
pub struct LayerBlockConfig {
    num_blocks: usize,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    bottleneck: bool,
}

impl LayerBlockConfig {
    /// Create a new instance of the residual layer block [config](LayerBlockConfig).
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bottleneck: bool,
    ) -> Self {
        Self {
            num_blocks,
            in_channels,
            out_channels,
            stride,
            bottleneck,
        }
    }

    /// Initialize a new [LayerBlock](LayerBlock) module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> LayerBlock<B> {
        let blocks = (0..self.num_blocks)
            .map(|b| {
                let config = if b == 0 {
                    // First block uses the specified stride
                    ResidualBlockConfig {
                        in_channels: self.in_channels,
                        out_channels: self.out_channels,
                        stride: self.stride,
                        bottleneck: self.bottleneck,
                    }
                } else {
                    // Other blocks use a stride of 1
                    ResidualBlockConfig {
                        in_channels: self.out_channels,
                        out_channels: self.out_channels,
                        stride: 1,
                        bottleneck: self.bottleneck,
                    }
                };
                config.init(device)
            })
            .collect();

        LayerBlock { blocks }
    }
}
