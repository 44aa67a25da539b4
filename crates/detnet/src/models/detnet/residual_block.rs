//! # Residual Block Wrapper

use crate::error;
use crate::models::detnet::basic_block::{
    BASIC_BLOCK_EXPANSION, BasicBlock, BasicBlockConfig, BasicBlockMeta,
};
use crate::models::detnet::bottleneck_block::{
    BOTTLENECK_BLOCK_EXPANSION, BottleneckBlock, BottleneckBlockConfig, BottleneckBlockMeta,
};
use crate::models::detnet::util::stride_div_output_resolution;
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights};
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};

/// [`ResidualBlock`] Meta API.
pub trait ResidualBlockMeta {
    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The number of output feature planes.
    fn out_planes(&self) -> usize;

    /// ``out_planes / planes`` for the wrapped variant.
    fn expansion_factor(&self) -> usize;

    /// The stride of convolution.
    ///
    /// Affects downsample behavior.
    fn stride(&self) -> usize;

    /// Does the block carry an identity-adjustment path?
    fn has_downsample(&self) -> bool;

    /// Get the output resolution for a given input resolution.
    ///
    /// # Arguments
    ///
    /// - `input_resolution`: ``[in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// ``[out_height=ceil(in_height/stride), out_width=ceil(in_width/stride)]``
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`ResidualBlock`] Config.
#[derive(Config, Debug)]
pub enum ResidualBlockConfig {
    /// A [`BasicBlock`].
    Basic(BasicBlockConfig),

    /// A [`BottleneckBlock`].
    Bottleneck(BottleneckBlockConfig),
}

impl ResidualBlockMeta for ResidualBlockConfig {
    fn in_planes(&self) -> usize {
        match self {
            Self::Basic(config) => config.in_planes(),
            Self::Bottleneck(config) => config.in_planes(),
        }
    }

    fn out_planes(&self) -> usize {
        match self {
            Self::Basic(config) => config.out_planes(),
            Self::Bottleneck(config) => config.out_planes(),
        }
    }

    fn expansion_factor(&self) -> usize {
        match self {
            Self::Basic(_) => BASIC_BLOCK_EXPANSION,
            Self::Bottleneck(_) => BOTTLENECK_BLOCK_EXPANSION,
        }
    }

    fn stride(&self) -> usize {
        match self {
            Self::Basic(config) => config.stride(),
            Self::Bottleneck(config) => config.stride(),
        }
    }

    fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(config) => config.has_downsample(),
            Self::Bottleneck(config) => config.has_downsample(),
        }
    }
}

impl From<BasicBlockConfig> for ResidualBlockConfig {
    fn from(config: BasicBlockConfig) -> Self {
        Self::Basic(config)
    }
}

impl From<BottleneckBlockConfig> for ResidualBlockConfig {
    fn from(config: BottleneckBlockConfig) -> Self {
        Self::Bottleneck(config)
    }
}

impl ResidualBlockConfig {
    /// Build a block config of either variant.
    ///
    /// # Arguments
    ///
    /// - `in_planes`: input planes.
    /// - `planes`: block width; the block emits ``planes * expansion``.
    /// - `stride`: block stride.
    /// - `bottleneck`: select [`BottleneckBlock`] over [`BasicBlock`].
    pub fn build(
        in_planes: usize,
        planes: usize,
        stride: usize,
        bottleneck: bool,
    ) -> Self {
        if bottleneck {
            BottleneckBlockConfig::new(in_planes, planes)
                .with_stride(stride)
                .into()
        } else {
            BasicBlockConfig::new(in_planes, planes)
                .with_stride(stride)
                .into()
        }
    }

    /// Initialize a [`ResidualBlock`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResidualBlock<B> {
        match self {
            Self::Basic(config) => ResidualBlock::Basic(config.clone().init(device)),
            Self::Bottleneck(config) => ResidualBlock::Bottleneck(config.clone().init(device)),
        }
    }
}

/// A [`BasicBlock`] or [`BottleneckBlock`] wrapper.
#[derive(Module, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ResidualBlock<B: Backend> {
    /// A [`BasicBlock`].
    Basic(BasicBlock<B>),

    /// A [`BottleneckBlock`].
    Bottleneck(BottleneckBlock<B>),
}

impl<B: Backend> From<BasicBlock<B>> for ResidualBlock<B> {
    fn from(block: BasicBlock<B>) -> Self {
        Self::Basic(block)
    }
}

impl<B: Backend> From<BottleneckBlock<B>> for ResidualBlock<B> {
    fn from(block: BottleneckBlock<B>) -> Self {
        Self::Bottleneck(block)
    }
}

impl<B: Backend> ResidualBlockMeta for ResidualBlock<B> {
    fn in_planes(&self) -> usize {
        match self {
            Self::Basic(block) => block.in_planes(),
            Self::Bottleneck(block) => block.in_planes(),
        }
    }

    fn out_planes(&self) -> usize {
        match self {
            Self::Basic(block) => block.out_planes(),
            Self::Bottleneck(block) => block.out_planes(),
        }
    }

    fn expansion_factor(&self) -> usize {
        match self {
            Self::Basic(_) => BASIC_BLOCK_EXPANSION,
            Self::Bottleneck(_) => BOTTLENECK_BLOCK_EXPANSION,
        }
    }

    fn stride(&self) -> usize {
        match self {
            Self::Basic(block) => block.stride(),
            Self::Bottleneck(block) => block.stride(),
        }
    }

    fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(block) => block.has_downsample(),
            Self::Bottleneck(block) => block.has_downsample(),
        }
    }
}

impl<B: Backend> ResidualBlock<B> {
    /// Apply the wrapped block to the input.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes=planes*expansion_factor, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }

    /// Number of trainable scalars held by this block.
    pub fn num_weights(&self) -> usize {
        match self {
            Self::Basic(block) => block.num_weights(),
            Self::Bottleneck(block) => block.num_weights(),
        }
    }
}

impl<B: Backend> NamedWeights<B> for ResidualBlock<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        match self {
            Self::Basic(block) => block.export_weights(prefix, out),
            Self::Bottleneck(block) => block.export_weights(prefix, out),
        }
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        Ok(match self {
            Self::Basic(block) => block.import_weights(prefix, session)?.into(),
            Self::Bottleneck(block) => block.import_weights(prefix, session)?.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;

    #[test]
    fn test_residual_block_config() {
        let cfg = ResidualBlockConfig::build(16, 32, 2, false);
        assert!(matches!(cfg, ResidualBlockConfig::Basic(_)));
        assert_eq!(cfg.in_planes(), 16);
        assert_eq!(cfg.out_planes(), 32);
        assert_eq!(cfg.expansion_factor(), 1);
        assert_eq!(cfg.stride(), 2);
        assert!(cfg.has_downsample());
        assert_eq!(cfg.output_resolution([20, 20]), [10, 10]);

        let cfg = ResidualBlockConfig::build(16, 32, 2, true);
        assert!(matches!(cfg, ResidualBlockConfig::Bottleneck(_)));
        assert_eq!(cfg.out_planes(), 128);
        assert_eq!(cfg.expansion_factor(), 4);
        assert_eq!(cfg.output_resolution([20, 20]), [10, 10]);
    }

    #[test]
    fn test_residual_block_forward() {
        type B = NdArray<f32>;
        let device = Default::default();

        for (bottleneck, out_planes) in [(false, 8), (true, 32)] {
            let block: ResidualBlock<B> =
                ResidualBlockConfig::build(4, 8, 2, bottleneck).init(&device);
            assert_eq!(block.out_planes(), out_planes);
            assert!(block.has_downsample());

            let output = block.forward(Tensor::ones([2, 4, 8, 8], &device));
            assert_shape_contract!(
                ["batch", "out_planes", "out_height", "out_width"],
                &output,
                &[
                    ("batch", 2),
                    ("out_planes", out_planes),
                    ("out_height", 4),
                    ("out_width", 4)
                ],
            );
        }
    }
}
