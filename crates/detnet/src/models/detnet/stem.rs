//! # Input Stem
//!
//! ``conv7x7/2 (pad 3) -> BatchNorm -> ReLU -> MaxPool3x3/2 (pad 1)``
//!
//! The stem reduces the input resolution by 4 and lifts the input channels
//! to 64 planes. Its weights live at the network root (``conv1.*``, ``bn1.*``).

use crate::error;
use crate::layers::conv_norm::{ConvNorm, ConvNormConfig, ConvNormMeta};
use crate::models::detnet::util::{join_path, stride_div_output_resolution};
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights, export_conv_norm, import_conv_norm};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{PaddingConfig2d, Relu};
use burn::prelude::{Backend, Config, Module, Tensor};

/// Default stem input channels.
///
/// The tracker feeds 4-plane images.
pub const DEFAULT_STEM_IN_CHANNELS: usize = 4;

/// Stem output planes.
pub const STEM_OUT_PLANES: usize = 64;

/// [`Stem`] Meta API.
pub trait StemMeta {
    /// Input channels.
    fn in_channels(&self) -> usize;

    /// Output planes.
    fn out_planes(&self) -> usize;

    /// Total stride: conv stride times pool stride.
    fn stride(&self) -> usize {
        4
    }

    /// Get the output resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let conv = stride_div_output_resolution(input_resolution, 2);
        stride_div_output_resolution(conv, 2)
    }
}

/// [`Stem`] Config.
#[derive(Config, Debug)]
pub struct StemConfig {
    /// Input channels.
    #[config(default = "DEFAULT_STEM_IN_CHANNELS")]
    pub in_channels: usize,

    /// Output planes.
    #[config(default = "STEM_OUT_PLANES")]
    pub out_planes: usize,
}

impl StemMeta for StemConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_planes(&self) -> usize {
        self.out_planes
    }
}

impl StemConfig {
    /// Initialize a [`Stem`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> Stem<B> {
        let conv_norm: ConvNormConfig =
            Conv2dConfig::new([self.in_channels, self.out_planes], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .into();

        let pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1));

        Stem {
            conv_norm: conv_norm.init(device),
            act: Relu::new(),
            pool: pool.init(),
        }
    }
}

/// Input stem.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    /// 7x7 conv/norm.
    pub conv_norm: ConvNorm<B>,

    /// Activation.
    pub act: Relu,

    /// Max pool.
    pub pool: MaxPool2d,
}

impl<B: Backend> StemMeta for Stem<B> {
    fn in_channels(&self) -> usize {
        self.conv_norm.in_channels()
    }

    fn out_planes(&self) -> usize {
        self.conv_norm.out_channels()
    }
}

impl<B: Backend> Stem<B> {
    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, ceil(in_height/4), ceil(in_width/4)]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, in_height, in_width] = unpack_shape_contract!(
            ["batch", "in_channels", "in_height", "in_width"],
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_channels", self.in_channels())],
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let x = self.conv_norm.forward(input);
        let x = self.act.forward(x);
        let x = self.pool.forward(x);

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("out_height", out_height),
                ("out_width", out_width)
            ],
        );
        x
    }

    /// Number of trainable scalars held by the stem.
    pub fn num_weights(&self) -> usize {
        self.conv_norm.num_weights()
    }
}

/// The stem's conv/norm are ``{prefix}.conv1`` / ``{prefix}.bn1``.
impl<B: Backend> NamedWeights<B> for Stem<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        export_conv_norm(
            &self.conv_norm,
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            out,
        );
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        Ok(Self {
            conv_norm: import_conv_norm(
                self.conv_norm,
                &join_path(prefix, "conv1"),
                &join_path(prefix, "bn1"),
                session,
            )?,
            act: self.act,
            pool: self.pool,
        })
    }
}
