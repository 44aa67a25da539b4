//! # Residual Stage
//!
//! A [`Stage`] is a sequence of [`ResidualBlock`]s of one variant.
//!
//! [`StageMeta`] defines a common meta API for [`Stage`]
//! and [`StageConfig`].
//!
//! [`StageConfig`] implements [`Config`], and provides
//! [`StageConfig::init`] to initialize a [`Stage`].

use crate::error::{self, DetNetError};
use crate::models::detnet::residual_block::{
    ResidualBlock, ResidualBlockConfig, ResidualBlockMeta,
};
use crate::models::detnet::util::join_path;
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};

/// [`Stage`] Meta API.
pub trait StageMeta {
    /// The number of blocks.
    fn len(&self) -> usize;

    /// Check if the stage is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of input feature planes.
    fn in_planes(&self) -> usize;

    /// The number of output feature planes.
    fn out_planes(&self) -> usize;

    /// Get the effective stride of the stage.
    fn stride(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2];
}

/// [`Stage`] Configuration.
#[derive(Config, Debug)]
pub struct StageConfig {
    /// The component blocks.
    pub blocks: Vec<ResidualBlockConfig>,
}

impl From<Vec<ResidualBlockConfig>> for StageConfig {
    fn from(blocks: Vec<ResidualBlockConfig>) -> Self {
        Self { blocks }
    }
}

impl StageMeta for StageConfig {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_planes(&self) -> usize {
        self.blocks[0].in_planes()
    }

    fn out_planes(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_planes()
    }

    fn stride(&self) -> usize {
        self.blocks
            .iter()
            .fold(1, |acc, block| acc * block.stride())
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        self.blocks
            .iter()
            .fold(input_resolution, |res, block| block.output_resolution(res))
    }
}

impl StageConfig {
    /// Build a stage config.
    ///
    /// Block 0 takes `in_planes` and `stride`, and carries the
    /// identity-adjustment path when either changes the shape;
    /// the remaining blocks run at stride 1 on ``planes * expansion``.
    ///
    /// # Arguments
    ///
    /// - `num_blocks`: number of blocks.
    /// - `in_planes`: input planes.
    /// - `planes`: block width.
    /// - `stride`: stride of the first block.
    /// - `bottleneck`: select the bottleneck variant.
    pub fn build(
        num_blocks: usize,
        in_planes: usize,
        planes: usize,
        stride: usize,
        bottleneck: bool,
    ) -> Self {
        let first = ResidualBlockConfig::build(in_planes, planes, stride, bottleneck);
        let out_planes = first.out_planes();

        let blocks = (0..num_blocks)
            .map(|b| {
                if b == 0 {
                    first.clone()
                } else {
                    ResidualBlockConfig::build(out_planes, planes, 1, bottleneck)
                }
            })
            .collect();

        Self { blocks }
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> error::Result<()> {
        if self.is_empty() {
            return Err(DetNetError::EmptyStage {
                context: "stage".to_string(),
            });
        }

        for idx in 1..self.blocks.len() {
            let prev = &self.blocks[idx - 1];
            let curr = &self.blocks[idx];
            if prev.out_planes() != curr.in_planes() {
                return Err(DetNetError::ChannelMismatch {
                    context: "stage".to_string(),
                    producer: format!("block[{}]", idx - 1),
                    produced: prev.out_planes(),
                    consumer: format!("block[{idx}]"),
                    expected: curr.in_planes(),
                });
            }
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Initialize a new [`Stage`].
    ///
    /// # Panics
    ///
    /// If the config is not valid.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> Stage<B> {
        self.expect_valid();

        Stage {
            blocks: self
                .blocks
                .into_iter()
                .map(|block| block.init(device))
                .collect(),
        }
    }
}

/// Residual stage.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    /// Internal blocks.
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> StageMeta for Stage<B> {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_planes(&self) -> usize {
        self.blocks[0].in_planes()
    }

    fn out_planes(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_planes()
    }

    fn stride(&self) -> usize {
        self.blocks
            .iter()
            .fold(1, |acc, block| acc * block.stride())
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        self.blocks
            .iter()
            .fold(input_resolution, |res, block| block.output_resolution(res))
    }
}

impl<B: Backend> Stage<B> {
    /// Apply the stage.
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

        let x = self.blocks.iter().fold(input, |x, block| block.forward(x));

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

    /// Number of trainable scalars held by this stage.
    pub fn num_weights(&self) -> usize {
        self.blocks.iter().map(ResidualBlock::num_weights).sum()
    }
}

/// Blocks are addressed by index: ``{prefix}.0``, ``{prefix}.1``, ...
impl<B: Backend> NamedWeights<B> for Stage<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        for (idx, block) in self.blocks.iter().enumerate() {
            block.export_weights(&join_path(prefix, &idx.to_string()), out);
        }
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(idx, block)| block.import_weights(&join_path(prefix, &idx.to_string()), session))
            .collect::<error::Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }
}
