//! # Bottleneck Block
//!
//! [`BottleneckBlock`] is the three-convolution residual unit
//! (1x1 reduce, 3x3 strided, 1x1 widen) with expansion factor 4.
//!
//! [`BottleneckBlockMeta`] defines a common meta API for [`BottleneckBlock`]
//! and [`BottleneckBlockConfig`].

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

/// Output planes per unit of `planes` for [`BottleneckBlock`].
pub const BOTTLENECK_BLOCK_EXPANSION: usize = 4;

/// [`BottleneckBlock`] Meta trait.
pub trait BottleneckBlockMeta {
    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The internal (pinched) planes.
    fn planes(&self) -> usize;

    /// The number of output feature planes.
    ///
    /// ``out_planes = planes * BOTTLENECK_BLOCK_EXPANSION``
    fn out_planes(&self) -> usize {
        self.planes() * BOTTLENECK_BLOCK_EXPANSION
    }

    /// The stride of the 3x3 conv and of the downsample path.
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
    /// ``[out_height, out_width]``
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        stride_div_output_resolution(input_resolution, self.stride())
    }
}

/// [`BottleneckBlock`] Config.
#[derive(Config, Debug)]
pub struct BottleneckBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// The internal planes; the block emits ``planes * 4``.
    pub planes: usize,

    /// The stride of the 3x3 conv.
    #[config(default = 1)]
    pub stride: usize,
}

impl BottleneckBlockMeta for BottleneckBlockConfig {
    fn in_planes(&self) -> usize {
        self.in_planes
    }

    fn planes(&self) -> usize {
        self.planes
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn has_downsample(&self) -> bool {
        self.stride != 1 || self.in_planes != self.out_planes()
    }
}

impl BottleneckBlockConfig {
    /// Initialize a [`BottleneckBlock`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> BottleneckBlock<B> {
        let in_planes = self.in_planes();
        let planes = self.planes();
        let out_planes = self.out_planes();
        let stride = self.stride();

        let conv_norm1: ConvNormConfig = Conv2dConfig::new([in_planes, planes], [1, 1])
            .with_bias(false)
            .into();

        let conv_norm2: ConvNormConfig = Conv2dConfig::new([planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .into();

        let conv_norm3: ConvNormConfig = Conv2dConfig::new([planes, out_planes], [1, 1])
            .with_bias(false)
            .into();

        let downsample = if self.has_downsample() {
            Some(ProjectionShortcutConfig::new(in_planes, out_planes).with_stride(stride))
        } else {
            None
        };

        BottleneckBlock {
            conv_norm1: conv_norm1.init(device),
            conv_norm2: conv_norm2.init(device),
            conv_norm3: conv_norm3.init(device),
            act: Relu::new(),
            downsample: downsample.map(|cfg| cfg.init(device)),
        }
    }
}

/// Bottleneck Block.
#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
    /// 1x1 reduce conv/norm.
    pub conv_norm1: ConvNorm<B>,

    /// 3x3 strided conv/norm.
    pub conv_norm2: ConvNorm<B>,

    /// 1x1 widen conv/norm.
    pub conv_norm3: ConvNorm<B>,

    /// Shared activation.
    pub act: Relu,

    /// Optional identity-adjustment path for the residual connection.
    pub downsample: Option<ProjectionShortcut<B>>,
}

impl<B: Backend> BottleneckBlockMeta for BottleneckBlock<B> {
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

    fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl<B: Backend> BottleneckBlock<B> {
    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes=planes*4, out_height, out_width]`` tensor.
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
        assert_shape_contract_periodically!(OUT_CONTRACT, &shortcut, &bindings);

        let x = self.conv_norm1.forward(input);
        let x = self.act.forward(x);

        let x = self.conv_norm2.forward(x);
        let x = self.act.forward(x);

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

impl<B: Backend> NamedWeights<B> for BottleneckBlock<B> {
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
        Ok(Self {
            conv_norm1: import_conv_norm(
                self.conv_norm1,
                &join_path(prefix, "conv1"),
                &join_path(prefix, "bn1"),
                session,
            )?,
            conv_norm2: import_conv_norm(
                self.conv_norm2,
                &join_path(prefix, "conv2"),
                &join_path(prefix, "bn2"),
                session,
            )?,
            conv_norm3: import_conv_norm(
                self.conv_norm3,
                &join_path(prefix, "conv3"),
                &join_path(prefix, "bn3"),
                session,
            )?,
            act: self.act,
            downsample: match self.downsample {
                Some(downsample) => {
                    Some(downsample.import_weights(&join_path(prefix, "downsample"), session)?)
                }
                None => None,
            },
        })
    }
}
