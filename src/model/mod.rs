mod block;
pub mod imagenet;
pub mod resnet;
#[cfg(feature = "pretrained")]
pub mod weights;
