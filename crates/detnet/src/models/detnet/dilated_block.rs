//! # Dilated Detection Block
//!
//! [`DilatedBlock`] is the head's residual unit: a 1x1 conv, a 3x3 conv
//! with dilation 2, and a 1x1 conv, each followed by a batch norm.
//! The receptive field grows without reducing resolution.
//!
//! The identity path is selected by [`DilatedBlockConfig::shortcut`]:
//! * [`Shortcut::Identity`] - type [`DilatedBlockType::A`] with matching shapes;
//!   the input is added unchanged and the block carries no extra weights.
//! * [`Shortcut::Projection`] - type [`DilatedBlockType::B`], a stride, or a
//!   channel change; the input passes through a 1x1 conv + norm first.

use crate::error;
use crate::layers::conv_norm::{ConvNorm, ConvNormConfig, ConvNormMeta};
use crate::models::detnet::downsample::{ProjectionShortcut, ProjectionShortcutConfig};
use crate::models::detnet::util::{join_path, stride_div_output_resolution};
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights, export_conv_norm, import_conv_norm};
use bimm_contracts::{
    assert_shape_contract_periodically, define_shape_contract, unpack_shape_contract,
};
use burn::nn::conv::Conv2dConfig;
use burn::nn::{PaddingConfig2d, Relu};
use burn::prelude::{Backend, Config, Module, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output planes per unit of `planes` for [`DilatedBlock`].
pub const DILATED_BLOCK_EXPANSION: usize = 1;

/// Dilation of the middle conv.
pub const DILATED_BLOCK_DILATION: usize = 2;

/// Dilated block flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DilatedBlockType {
    /// Pass-through identity when shapes allow it.
    #[default]
    A,

    /// Always project the identity.
    B,
}

impl fmt::Display for DilatedBlockType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// The identity path of a [`DilatedBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    /// Input added unchanged.
    Identity,

    /// Input projected by a 1x1 conv + norm.
    Projection,
}

/// [`DilatedBlock`] Meta trait.
pub trait DilatedBlockMeta {
    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The internal planes.
    fn planes(&self) -> usize;

    /// The number of output feature planes.
    fn out_planes(&self) -> usize {
        self.planes() * DILATED_BLOCK_EXPANSION
    }

    /// The stride of the dilated conv and of the projection.
    fn stride(&self) -> usize;

    /// The identity path in use.
    fn shortcut(&self) -> Shortcut;

    /// Get the output resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`DilatedBlock`] Config.
#[derive(Config, Debug)]
pub struct DilatedBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// The internal and output planes.
    pub planes: usize,

    /// The stride of the dilated conv.
    #[config(default = 1)]
    pub stride: usize,

    /// Block flavor.
    #[config(default = "DilatedBlockType::A")]
    pub block_type: DilatedBlockType,
}

impl DilatedBlockMeta for DilatedBlockConfig {
    fn in_planes(&self) -> usize {
        self.in_planes
    }

    fn planes(&self) -> usize {
        self.planes
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn shortcut(&self) -> Shortcut {
        if self.stride != 1
            || self.in_planes != self.out_planes()
            || self.block_type == DilatedBlockType::B
        {
            Shortcut::Projection
        } else {
            Shortcut::Identity
        }
    }
}

impl DilatedBlockConfig {
    /// Initialize a [`DilatedBlock`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> DilatedBlock<B> {
        let in_planes = self.in_planes();
        let planes = self.planes();
        let out_planes = self.out_planes();
        let stride = self.stride();
        let pad = DILATED_BLOCK_DILATION;

        let conv_norm1: ConvNormConfig = Conv2dConfig::new([in_planes, planes], [1, 1])
            .with_bias(false)
            .into();

        let conv_norm2: ConvNormConfig = Conv2dConfig::new([planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_dilation([DILATED_BLOCK_DILATION, DILATED_BLOCK_DILATION])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .into();

        let conv_norm3: ConvNormConfig = Conv2dConfig::new([planes, out_planes], [1, 1])
            .with_bias(false)
            .into();

        let downsample = match self.shortcut() {
            Shortcut::Projection => Some(
                ProjectionShortcutConfig::new(in_planes, out_planes)
                    .with_stride(stride)
                    .init(device),
            ),
            Shortcut::Identity => None,
        };

        DilatedBlock {
            conv_norm1: conv_norm1.init(device),
            conv_norm2: conv_norm2.init(device),
            conv_norm3: conv_norm3.init(device),
            act: Relu::new(),
            downsample,
        }
    }
}

/// Dilated Detection Block.
#[derive(Module, Debug)]
pub struct DilatedBlock<B: Backend> {
    /// 1x1 conv/norm.
    pub conv_norm1: ConvNorm<B>,

    /// Dilated 3x3 conv/norm.
    pub conv_norm2: ConvNorm<B>,

    /// 1x1 conv/norm.
    pub conv_norm3: ConvNorm<B>,

    /// Shared activation.
    pub act: Relu,

    /// Projection; `None` for [`Shortcut::Identity`].
    pub downsample: Option<ProjectionShortcut<B>>,
}

impl<B: Backend> DilatedBlockMeta for DilatedBlock<B> {
    fn in_planes(&self) -> usize {
        self.conv_norm1.in_channels()
    }

    fn planes(&self) -> usize {
        self.conv_norm1.out_channels()
    }

    fn out_planes(&self) -> usize {
        self.conv_norm3.out_channels()
    }

    fn stride(&self) -> usize {
        self.conv_norm2.stride()[0]
    }

    fn shortcut(&self) -> Shortcut {
        match self.downsample {
            Some(_) => Shortcut::Projection,
            None => Shortcut::Identity,
        }
    }
}

impl<B: Backend> DilatedBlock<B> {
    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, in_height, in_width] = unpack_shape_contract!(
            ["batch", "in_planes", "in_height", "in_width"],
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_planes", self.in_planes())],
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);
        define_shape_contract!(
            OUT_CONTRACT,
            ["batch", "out_planes", "out_height", "out_width"]
        );
        let bindings = [
            ("batch", batch),
            ("out_planes", self.out_planes()),
            ("out_height", out_height),
            ("out_width", out_width),
        ];

        let shortcut = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.act.forward(self.conv_norm1.forward(input));
        let x = self.act.forward(self.conv_norm2.forward(x));
        let x = self.conv_norm3.forward(x);

        let x = self.act.forward(x + shortcut);

        assert_shape_contract_periodically!(OUT_CONTRACT, &x, &bindings);
        x
    }

    /// Number of trainable scalars held by this block.
    pub fn num_weights(&self) -> usize {
        self.conv_norm1.num_weights()
            + self.conv_norm2.num_weights()
            + self.conv_norm3.num_weights()
            + self
                .downsample
                .as_ref()
                .map_or(0, |downsample| downsample.num_weights())
    }
}

impl<B: Backend> NamedWeights<B> for DilatedBlock<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        for (layer, idx) in [
            (&self.conv_norm1, 1),
            (&self.conv_norm2, 2),
            (&self.conv_norm3, 3),
        ] {
            export_conv_norm(
                layer,
                &join_path(prefix, &format!("conv{idx}")),
                &join_path(prefix, &format!("bn{idx}")),
                out,
            );
        }
        if let Some(downsample) = &self.downsample {
            downsample.export_weights(&join_path(prefix, "downsample"), out);
        }
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        let conv_norm1 = import_conv_norm(
            self.conv_norm1,
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            session,
        )?;
        let conv_norm2 = import_conv_norm(
            self.conv_norm2,
            &join_path(prefix, "conv2"),
            &join_path(prefix, "bn2"),
            session,
        )?;
        let conv_norm3 = import_conv_norm(
            self.conv_norm3,
            &join_path(prefix, "conv3"),
            &join_path(prefix, "bn3"),
            session,
        )?;
        let downsample = match self.downsample {
            Some(downsample) => {
                Some(downsample.import_weights(&join_path(prefix, "downsample"), session)?)
            }
            None => None,
        };

        Ok(Self {
            conv_norm1,
            conv_norm2,
            conv_norm3,
            act: self.act,
            downsample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;

    #[test]
    fn test_dilated_block_config_shortcut() {
        let config = DilatedBlockConfig::new(256, 256);
        assert_eq!(config.block_type, DilatedBlockType::A);
        assert_eq!(config.out_planes(), 256);
        assert_eq!(config.shortcut(), Shortcut::Identity);

        let config = config.with_block_type(DilatedBlockType::B);
        assert_eq!(config.shortcut(), Shortcut::Projection);

        assert_eq!(
            DilatedBlockConfig::new(512, 256).shortcut(),
            Shortcut::Projection
        );
        assert_eq!(
            DilatedBlockConfig::new(256, 256).with_stride(2).shortcut(),
            Shortcut::Projection
        );
    }

    #[test]
    fn test_dilated_block_type_a_has_no_extra_weights() {
        type B = NdArray<f32>;
        let device = Default::default();

        let planes = 8;
        let block: DilatedBlock<B> = DilatedBlockConfig::new(planes, planes).init(&device);
        assert_eq!(block.shortcut(), Shortcut::Identity);

        let per_conv = |k: usize| planes * planes * k * k + 2 * planes;
        assert_eq!(
            block.num_weights(),
            per_conv(1) + per_conv(3) + per_conv(1)
        );

        let projected: DilatedBlock<B> = DilatedBlockConfig::new(planes, planes)
            .with_block_type(DilatedBlockType::B)
            .init(&device);
        assert_eq!(projected.shortcut(), Shortcut::Projection);
        assert_eq!(
            projected.num_weights(),
            block.num_weights() + per_conv(1)
        );
    }

    #[test]
    fn test_dilated_block_forward_preserves_resolution() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: DilatedBlock<B> = DilatedBlockConfig::new(6, 4)
            .with_block_type(DilatedBlockType::B)
            .init(&device);
        assert_eq!(block.conv_norm2.dilation(), &[2, 2]);

        let output = block.forward(Tensor::ones([2, 6, 7, 5], &device));
        assert_shape_contract!(
            ["batch", "out_planes", "out_height", "out_width"],
            &output,
            &[
                ("batch", 2),
                ("out_planes", 4),
                ("out_height", 7),
                ("out_width", 5)
            ],
        );

        let min = output.min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_dilated_block_state_dict_names() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: DilatedBlock<B> = DilatedBlockConfig::new(4, 4).init(&device);
        let mut weights = WeightMap::new();
        block.export_weights("layer5.1", &mut weights);
        assert_eq!(weights.len(), 3 * 5);
        assert!(!weights.names().any(|name| name.contains("downsample")));

        let block: DilatedBlock<B> = DilatedBlockConfig::new(8, 4)
            .with_block_type(DilatedBlockType::B)
            .init(&device);
        let mut weights = WeightMap::new();
        block.export_weights("layer5.0", &mut weights);
        assert!(weights.contains("layer5.0.conv2.weight"));
        assert_eq!(weights.get("layer5.0.conv2.weight").unwrap().shape, vec![4, 4, 3, 3]);
        assert!(weights.contains("layer5.0.downsample.1.running_mean"));
    }
}
