//! # Projection Shortcut
//!
//! When a residual block changes resolution or width, its identity branch is
//! replaced by a strided ``1x1`` conv + batch norm so the two branches can be
//! summed. Blocks hold it as ``downsample``; in state-dict form it is the
//! sequence ``downsample.0`` (conv), ``downsample.1`` (norm).

use crate::error;
use crate::layers::conv_norm::{ConvNorm, ConvNormConfig, ConvNormMeta};
use crate::models::detnet::util::stride_div_output_resolution;
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::conv::Conv2dConfig;
use burn::prelude::{Backend, Config, Module, Tensor};

/// [`ProjectionShortcut`] config.
#[derive(Config, Debug)]
pub struct ProjectionShortcutConfig {
    /// Planes entering the block.
    pub in_planes: usize,

    /// Planes leaving the block.
    pub out_planes: usize,

    /// Spatial stride; matches the block's strided conv.
    #[config(default = 1)]
    pub stride: usize,
}

impl ProjectionShortcutConfig {
    /// ``[ceil(h / stride), ceil(w / stride)]``.
    pub fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride)
    }

    /// Build the [`ProjectionShortcut`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ProjectionShortcut<B> {
        let projection: ConvNormConfig = Conv2dConfig::new([self.in_planes, self.out_planes], [1, 1])
            .with_stride([self.stride; 2])
            .with_bias(false)
            .into();

        ProjectionShortcut {
            conv_norm: projection.init(device),
        }
    }
}

/// Strided ``1x1`` conv + batch norm on a residual block's identity branch.
#[derive(Module, Debug)]
pub struct ProjectionShortcut<B: Backend> {
    /// The projection.
    pub conv_norm: ConvNorm<B>,
}

impl<B: Backend> ProjectionShortcut<B> {
    /// Planes entering the block.
    pub fn in_planes(&self) -> usize {
        self.conv_norm.in_channels()
    }

    /// Planes leaving the block.
    pub fn out_planes(&self) -> usize {
        self.conv_norm.out_channels()
    }

    /// Spatial stride.
    pub fn stride(&self) -> usize {
        self.conv_norm.stride()[0]
    }

    /// Project ``[batch, in_planes, h, w]`` to ``[batch, out_planes, h', w']``.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, height, width] = unpack_shape_contract!(
            ["batch", "in_planes", "height", "width"],
            &input,
            &["batch", "height", "width"],
            &[("in_planes", self.in_planes())]
        );
        let [out_height, out_width] = stride_div_output_resolution([height, width], self.stride());

        let x = self.conv_norm.forward(input);

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );
        x
    }

    /// Number of trainable scalars held by this path.
    pub fn num_weights(&self) -> usize {
        self.conv_norm.num_weights()
    }
}

impl<B: Backend> NamedWeights<B> for ProjectionShortcut<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        self.conv_norm.export_weights(prefix, out);
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        let conv_norm = self.conv_norm.import_weights(prefix, session)?;
        Ok(Self { conv_norm })
    }
}
