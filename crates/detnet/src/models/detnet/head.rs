//! # Detection Head
//!
//! Three [`DilatedBlock`]s: ``in_channels -> 256`` (type B), then
//! ``256 -> 256`` (type A) twice. Resolution is unchanged.

use crate::error::{self, DetNetError};
use crate::models::detnet::dilated_block::{
    DilatedBlock, DilatedBlockConfig, DilatedBlockMeta, DilatedBlockType,
};
use crate::models::detnet::util::join_path;
use crate::weights::WeightMap;
use crate::weights::import::{ImportSession, NamedWeights};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};

/// Planes emitted by the detection head.
pub const HEAD_PLANES: usize = 256;

/// [`DetectionHeadConfig`] Config.
#[derive(Config, Debug)]
pub struct DetectionHeadConfig {
    /// The component blocks.
    pub blocks: Vec<DilatedBlockConfig>,
}

impl DetectionHeadConfig {
    /// Build the standard head for `in_channels` input planes.
    pub fn build(in_channels: usize) -> Self {
        Self {
            blocks: vec![
                DilatedBlockConfig::new(in_channels, HEAD_PLANES)
                    .with_block_type(DilatedBlockType::B),
                DilatedBlockConfig::new(HEAD_PLANES, HEAD_PLANES),
                DilatedBlockConfig::new(HEAD_PLANES, HEAD_PLANES),
            ],
        }
    }

    /// The number of input feature planes.
    ///
    /// # Panics
    ///
    /// If the head is empty.
    pub fn in_planes(&self) -> usize {
        self.blocks[0].in_planes()
    }

    /// The number of output feature planes.
    ///
    /// # Panics
    ///
    /// If the head is empty.
    pub fn out_planes(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_planes()
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> error::Result<()> {
        if self.blocks.is_empty() {
            return Err(DetNetError::EmptyStage {
                context: "detection head".to_string(),
            });
        }
        for idx in 1..self.blocks.len() {
            let prev = &self.blocks[idx - 1];
            let curr = &self.blocks[idx];
            if prev.out_planes() != curr.in_planes() {
                return Err(DetNetError::ChannelMismatch {
                    context: "detection head".to_string(),
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

    /// Initialize a [`DetectionHead`].
    ///
    /// # Panics
    ///
    /// If the config is not valid.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> DetectionHead<B> {
        self.expect_valid();
        DetectionHead {
            blocks: self
                .blocks
                .into_iter()
                .map(|block| block.init(device))
                .collect(),
        }
    }
}

/// Dilated detection head.
#[derive(Module, Debug)]
pub struct DetectionHead<B: Backend> {
    /// Internal blocks.
    pub blocks: Vec<DilatedBlock<B>>,
}

impl<B: Backend> DetectionHead<B> {
    /// The number of input feature planes.
    pub fn in_planes(&self) -> usize {
        self.blocks[0].in_planes()
    }

    /// The number of output feature planes.
    pub fn out_planes(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_planes()
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_planes, height, width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_planes, height, width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [batch, height, width] = unpack_shape_contract!(
            ["batch", "in_planes", "height", "width"],
            &input,
            &["batch", "height", "width"],
            &[("in_planes", self.in_planes())],
        );

        let x = self.blocks.iter().fold(input, |x, block| block.forward(x));

        assert_shape_contract_periodically!(
            ["batch", "out_planes", "height", "width"],
            &x,
            &[
                ("batch", batch),
                ("out_planes", self.out_planes()),
                ("height", height),
                ("width", width)
            ],
        );
        x
    }

    /// Number of trainable scalars held by the head.
    pub fn num_weights(&self) -> usize {
        self.blocks.iter().map(DilatedBlock::num_weights).sum()
    }
}

impl<B: Backend> NamedWeights<B> for DetectionHead<B> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detnet::dilated_block::Shortcut;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::NdArray;

    #[test]
    fn test_detection_head_config_build() {
        let config = DetectionHeadConfig::build(512);
        config.expect_valid();
        assert_eq!(config.blocks.len(), 3);
        assert_eq!(config.in_planes(), 512);
        assert_eq!(config.out_planes(), 256);

        let shortcuts: Vec<Shortcut> = config.blocks.iter().map(|b| b.shortcut()).collect();
        assert_eq!(
            shortcuts,
            vec![Shortcut::Projection, Shortcut::Identity, Shortcut::Identity]
        );

        // Matching input channels still project in block 0.
        let config = DetectionHeadConfig::build(256);
        assert_eq!(config.blocks[0].shortcut(), Shortcut::Projection);
    }

    #[test]
    fn test_detection_head_config_validation() {
        let config = DetectionHeadConfig::new(vec![
            DilatedBlockConfig::new(16, 8),
            DilatedBlockConfig::new(4, 4),
        ]);
        assert!(matches!(
            config.try_validate(),
            Err(DetNetError::ChannelMismatch {
                produced: 8,
                expected: 4,
                ..
            })
        ));

        assert!(matches!(
            DetectionHeadConfig::new(Vec::new()).try_validate(),
            Err(DetNetError::EmptyStage { .. })
        ));
    }

    #[test]
    fn test_detection_head_forward() {
        type B = NdArray<f32>;
        let device = Default::default();

        let head: DetectionHead<B> = DetectionHeadConfig::build(32).init(&device);
        assert_eq!(head.in_planes(), 32);
        assert_eq!(head.out_planes(), 256);

        let output = head.forward(Tensor::ones([1, 32, 3, 3], &device));
        assert_shape_contract!(
            ["batch", "out_planes", "height", "width"],
            &output,
            &[
                ("batch", 1),
                ("out_planes", 256),
                ("height", 3),
                ("width", 3)
            ],
        );
    }

    #[test]
    fn test_detection_head_state_dict_names() {
        type B = NdArray<f32>;
        let device = Default::default();

        let head: DetectionHead<B> = DetectionHeadConfig::build(16).init(&device);
        let mut weights = WeightMap::new();
        head.export_weights("layer5", &mut weights);

        assert!(weights.contains("layer5.0.downsample.0.weight"));
        assert!(weights.contains("layer5.0.downsample.1.bias"));
        assert!(!weights.contains("layer5.1.downsample.0.weight"));
        assert!(!weights.contains("layer5.2.downsample.0.weight"));
        assert!(weights.contains("layer5.2.conv3.weight"));
    }
}
