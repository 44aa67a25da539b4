//! # Basic Block
//!
//! [`BasicBlock`] is the two-convolution residual unit (expansion factor 1).
//!
//! [`BasicBlockMeta`] defines a common meta API for [`BasicBlock`]
//! and [`BasicBlockConfig`].
//!
//! [`BasicBlockConfig`] implements [`Config`], and provides
//! [`BasicBlockConfig::init`] to initialize a [`BasicBlock`].
//!
//! [`BasicBlock`] implements [`Module`], and provides
//! [`BasicBlock::forward`].

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

/// Output planes per unit of `planes` for [`BasicBlock`].
pub const BASIC_BLOCK_EXPANSION: usize = 1;

/// [`BasicBlock`] Meta trait.
pub trait BasicBlockMeta {
    /// The size of the in channels dimension.
    fn in_planes(&self) -> usize;

    /// Configures the size of `out_planes`.
    fn planes(&self) -> usize;

    /// The size of the out channels dimension.
    ///
    /// ``out_planes = planes * BASIC_BLOCK_EXPANSION``
    fn out_planes(&self) -> usize {
        self.planes() * BASIC_BLOCK_EXPANSION
    }

    /// The stride of the first conv and of the downsample path.
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

/// [`BasicBlock`] Config.
#[derive(Config, Debug)]
pub struct BasicBlockConfig {
    /// The size of the in channels dimension.
    pub in_planes: usize,

    /// Configures the `out_planes`.
    pub planes: usize,

    /// The stride of the first conv.
    #[config(default = 1)]
    pub stride: usize,
}

impl BasicBlockMeta for BasicBlockConfig {
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

impl BasicBlockConfig {
    /// Initialize a [`BasicBlock`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> BasicBlock<B> {
        let in_planes = self.in_planes();
        let planes = self.planes();
        let out_planes = self.out_planes();
        let stride = self.stride();

        let conv_norm1: ConvNormConfig = Conv2dConfig::new([in_planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .into();

        let conv_norm2: ConvNormConfig = Conv2dConfig::new([planes, out_planes], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .into();

        let downsample = if self.has_downsample() {
            Some(ProjectionShortcutConfig::new(in_planes, out_planes).with_stride(stride))
        } else {
            None
        };

        BasicBlock {
            conv_norm1: conv_norm1.init(device),
            conv_norm2: conv_norm2.init(device),
            act: Relu::new(),
            downsample: downsample.map(|cfg| cfg.init(device)),
        }
    }
}

/// Basic Block.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    /// First conv/norm layer; carries the stride.
    pub conv_norm1: ConvNorm<B>,

    /// Second conv/norm layer.
    pub conv_norm2: ConvNorm<B>,

    /// Shared activation.
    pub act: Relu,

    /// Optional identity-adjustment path for the residual connection.
    pub downsample: Option<ProjectionShortcut<B>>,
}

impl<B: Backend> BasicBlockMeta for BasicBlock<B> {
    fn in_planes(&self) -> usize {
        self.conv_norm1.in_channels()
    }

    fn planes(&self) -> usize {
        self.conv_norm1.out_channels()
    }

    fn out_planes(&self) -> usize {
        self.conv_norm2.out_channels()
    }

    fn stride(&self) -> usize {
        self.conv_norm1.stride()[0]
    }

    fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl<B: Backend> BasicBlock<B> {
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
        assert_shape_contract_periodically!(OUT_CONTRACT, &shortcut, &bindings);

        let x = self.conv_norm1.forward(input);
        let x = self.act.forward(x);

        let x = self.conv_norm2.forward(x);

        let x = self.act.forward(x + shortcut);

        assert_shape_contract_periodically!(OUT_CONTRACT, &x, &bindings);
        x
    }

    /// Number of trainable scalars held by this block.
    pub fn num_weights(&self) -> usize {
        self.conv_norm1.num_weights()
            + self.conv_norm2.num_weights()
            + self
                .downsample
                .as_ref()
                .map_or(0, |downsample| downsample.num_weights())
    }
}

impl<B: Backend> NamedWeights<B> for BasicBlock<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        export_conv_norm(
            &self.conv_norm1,
            &join_path(prefix, "conv1"),
            &join_path(prefix, "bn1"),
            out,
        );
        export_conv_norm(
            &self.conv_norm2,
            &join_path(prefix, "conv2"),
            &join_path(prefix, "bn2"),
            out,
        );
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
