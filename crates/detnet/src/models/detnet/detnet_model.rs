//! # `DetNet` Core Model
//!
//! ```text
//! stem -> layer1 -> layer2 -> layer3 -> layer4 -> layer5 (head)
//!      -> conv_end -> bn_end -> sigmoid -> permute(0, 2, 3, 1)
//! ```
//!
//! [`DetNetConfig`] is the structural description; [`DetNet`] owns the
//! parameters. A ``[batch, 4, 448, 448]`` input yields a
//! ``[batch, 14, 14, 10]`` grid of scores in ``[0, 1]``.

use crate::error::{self, DetNetError};
use crate::layers::conv_norm::{ConvNorm, ConvNormConfig, ConvNormMeta};
use crate::models::detnet::head::{DetectionHead, DetectionHeadConfig};
use crate::models::detnet::stage::{Stage, StageConfig, StageMeta};
use crate::models::detnet::stem::{
    DEFAULT_STEM_IN_CHANNELS, STEM_OUT_PLANES, Stem, StemConfig, StemMeta,
};
use crate::models::detnet::util::join_path;
use crate::weights::WeightMap;
use crate::weights::import::{
    ImportReport, ImportSession, NamedWeights, export_conv_norm, import_conv_norm,
};
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2dConfig;
use burn::prelude::{Backend, Config, Module, Tensor};
use burn::tensor::activation::sigmoid;

/// Stage widths.
pub const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// Stage strides.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// Default number of output channels per grid cell.
pub const DEFAULT_NUM_OUTPUTS: usize = 10;

/// [`DetNet`] Meta API.
pub trait DetNetMeta {
    /// Input channels.
    fn in_channels(&self) -> usize;

    /// Output channels per grid cell.
    fn num_outputs(&self) -> usize;

    /// Get the output grid resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2];
}

/// [`DetNet`] Config.
#[derive(Config, Debug)]
pub struct DetNetConfig {
    /// Blocks per residual stage.
    pub block_counts: [usize; 4],

    /// Input planes of the detection head; must equal stage 4's output.
    pub head_in_channels: usize,

    /// Use bottleneck residual blocks.
    #[config(default = false)]
    pub bottleneck: bool,

    /// Stem input channels.
    #[config(default = "DEFAULT_STEM_IN_CHANNELS")]
    pub in_channels: usize,

    /// Output channels per grid cell.
    #[config(default = "DEFAULT_NUM_OUTPUTS")]
    pub num_outputs: usize,
}

impl DetNetMeta for DetNetConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let res = self.stem_config().output_resolution(input_resolution);
        self.stage_configs()
            .iter()
            .filter(|stage| !stage.is_empty())
            .fold(res, |res, stage| stage.output_resolution(res))
    }
}

impl DetNetConfig {
    /// The [`StemConfig`].
    pub fn stem_config(&self) -> StemConfig {
        StemConfig::new().with_in_channels(self.in_channels)
    }

    /// The four [`StageConfig`]s, chained from the stem's output.
    pub fn stage_configs(&self) -> [StageConfig; 4] {
        let mut in_planes = STEM_OUT_PLANES;
        [0, 1, 2, 3].map(|idx| {
            let stage = StageConfig::build(
                self.block_counts[idx],
                in_planes,
                STAGE_PLANES[idx],
                STAGE_STRIDES[idx],
                self.bottleneck,
            );
            if !stage.is_empty() {
                in_planes = stage.out_planes();
            }
            stage
        })
    }

    /// The [`DetectionHeadConfig`].
    pub fn head_config(&self) -> DetectionHeadConfig {
        DetectionHeadConfig::build(self.head_in_channels)
    }

    /// Check if the config is valid.
    ///
    /// Every stage must be non-empty and valid; stage 4's output planes must
    /// equal `head_in_channels`.
    pub fn try_validate(&self) -> error::Result<()> {
        let stages = self.stage_configs();
        for (idx, stage) in stages.iter().enumerate() {
            if stage.is_empty() {
                return Err(DetNetError::EmptyStage {
                    context: format!("layer{}", idx + 1),
                });
            }
            stage.try_validate()?;
        }

        let stage_out = stages[3].out_planes();
        if stage_out != self.head_in_channels {
            return Err(DetNetError::ChannelMismatch {
                context: "network".to_string(),
                producer: "layer4".to_string(),
                produced: stage_out,
                consumer: "layer5".to_string(),
                expected: self.head_in_channels,
            });
        }

        self.head_config().try_validate()
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Initialize a [`DetNet`].
    ///
    /// # Panics
    ///
    /// If the config is not valid.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> DetNet<B> {
        self.expect_valid();

        let [layer1, layer2, layer3, layer4] = self.stage_configs();
        let head = self.head_config();

        let end: ConvNormConfig = Conv2dConfig::new([head.out_planes(), self.num_outputs], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .into();

        tracing::debug!(
            block_counts = ?self.block_counts,
            bottleneck = self.bottleneck,
            in_channels = self.in_channels,
            "building detnet"
        );

        DetNet {
            stem: self.stem_config().init(device),
            layer1: layer1.init(device),
            layer2: layer2.init(device),
            layer3: layer3.init(device),
            layer4: layer4.init(device),
            head: head.init(device),
            conv_norm_end: end.init(device),
        }
    }

    /// Validate, then initialize a [`DetNet`].
    pub fn try_init<B: Backend>(
        self,
        device: &B::Device,
    ) -> error::Result<DetNet<B>> {
        self.try_validate()?;
        Ok(self.init(device))
    }
}

/// Residual backbone with a dilated detection head.
#[derive(Module, Debug)]
pub struct DetNet<B: Backend> {
    /// Input stem.
    pub stem: Stem<B>,

    /// Residual stage 1.
    pub layer1: Stage<B>,

    /// Residual stage 2.
    pub layer2: Stage<B>,

    /// Residual stage 3.
    pub layer3: Stage<B>,

    /// Residual stage 4.
    pub layer4: Stage<B>,

    /// Dilated detection head.
    pub head: DetectionHead<B>,

    /// Output projection conv/norm.
    pub conv_norm_end: ConvNorm<B>,
}

impl<B: Backend> DetNetMeta for DetNet<B> {
    fn in_channels(&self) -> usize {
        self.stem.in_channels()
    }

    fn num_outputs(&self) -> usize {
        self.conv_norm_end.out_channels()
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let res = self.stem.output_resolution(input_resolution);
        self.stages()
            .iter()
            .fold(res, |res, stage| stage.output_resolution(res))
    }
}

impl<B: Backend> DetNet<B> {
    /// The residual stages, in order.
    pub fn stages(&self) -> [&Stage<B>; 4] {
        [&self.layer1, &self.layer2, &self.layer3, &self.layer4]
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_height, out_width, num_outputs]`` tensor, values in ``[0, 1]``.
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

        let x = self.stem.forward(input);

        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        let x = self.layer4.forward(x);

        let x = self.head.forward(x);

        let x = self.conv_norm_end.forward(x);
        let x = sigmoid(x);
        let x = x.permute([0, 2, 3, 1]);

        assert_shape_contract_periodically!(
            ["batch", "out_height", "out_width", "num_outputs"],
            &x,
            &[
                ("batch", batch),
                ("out_height", out_height),
                ("out_width", out_width),
                ("num_outputs", self.num_outputs())
            ],
        );
        x
    }

    /// Number of trainable scalars in the network.
    ///
    /// Counts conv weights and norm ``gamma``/``beta``; running statistics
    /// are excluded.
    pub fn num_weights(&self) -> usize {
        self.stem.num_weights()
            + self.stages().iter().map(|s| s.num_weights()).sum::<usize>()
            + self.head.num_weights()
            + self.conv_norm_end.num_weights()
    }

    /// Export the full parameter map under state-dict names.
    pub fn state_dict(&self) -> WeightMap {
        let mut out = WeightMap::new();
        self.export_weights("", &mut out);
        out
    }

    /// Copy matching entries of `weights` into the network.
    ///
    /// Names the network lacks are skipped, parameters the source lacks are
    /// kept. A matching name with a different shape is an error.
    pub fn import_state_dict(
        self,
        weights: &WeightMap,
    ) -> error::Result<(Self, ImportReport)> {
        let mut session = ImportSession::new(weights);
        let net = self.import_weights("", &mut session)?;
        Ok((net, session.finish()))
    }
}

impl<B: Backend> NamedWeights<B> for DetNet<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        self.stem.export_weights(prefix, out);
        for (idx, stage) in self.stages().into_iter().enumerate() {
            stage.export_weights(&join_path(prefix, &format!("layer{}", idx + 1)), out);
        }
        self.head.export_weights(&join_path(prefix, "layer5"), out);
        export_conv_norm(
            &self.conv_norm_end,
            &join_path(prefix, "conv_end"),
            &join_path(prefix, "bn_end"),
            out,
        );
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> error::Result<Self> {
        Ok(Self {
            stem: self.stem.import_weights(prefix, session)?,
            layer1: self
                .layer1
                .import_weights(&join_path(prefix, "layer1"), session)?,
            layer2: self
                .layer2
                .import_weights(&join_path(prefix, "layer2"), session)?,
            layer3: self
                .layer3
                .import_weights(&join_path(prefix, "layer3"), session)?,
            layer4: self
                .layer4
                .import_weights(&join_path(prefix, "layer4"), session)?,
            head: self
                .head
                .import_weights(&join_path(prefix, "layer5"), session)?,
            conv_norm_end: import_conv_norm(
                self.conv_norm_end,
                &join_path(prefix, "conv_end"),
                &join_path(prefix, "bn_end"),
                session,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::{Autodiff, NdArray};
    use burn::prelude::TensorData;

    #[test]
    fn test_detnet_config_defaults() {
        let config = DetNetConfig::new([2, 2, 2, 2], 512);
        assert!(!config.bottleneck);
        assert_eq!(config.in_channels(), 4);
        assert_eq!(config.num_outputs(), 10);
        config.expect_valid();

        assert_eq!(config.output_resolution([448, 448]), [14, 14]);
        assert_eq!(config.output_resolution([64, 64]), [2, 2]);
        assert_eq!(config.output_resolution([65, 63]), [3, 2]);
    }

    #[test]
    fn test_detnet_config_stage_chaining() {
        let config = DetNetConfig::new([3, 4, 6, 3], 2048).with_bottleneck(true);
        let stages = config.stage_configs();

        let planes: Vec<(usize, usize)> = stages
            .iter()
            .map(|s| (s.in_planes(), s.out_planes()))
            .collect();
        assert_eq!(
            planes,
            vec![(64, 256), (256, 512), (512, 1024), (1024, 2048)]
        );
        assert_eq!(
            stages.iter().map(|s| s.len()).collect::<Vec<_>>(),
            vec![3, 4, 6, 3]
        );
        config.expect_valid();
    }

    #[test]
    fn test_detnet_config_head_mismatch() {
        let config = DetNetConfig::new([2, 2, 2, 2], 2048);
        match config.try_validate() {
            Err(DetNetError::ChannelMismatch {
                producer,
                produced,
                consumer,
                expected,
                ..
            }) => {
                assert_eq!(producer, "layer4");
                assert_eq!(produced, 512);
                assert_eq!(consumer, "layer5");
                assert_eq!(expected, 2048);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            DetNetConfig::new([2, 0, 2, 2], 512).try_validate(),
            Err(DetNetError::EmptyStage { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "channel mismatch")]
    fn test_detnet_init_panics_on_mismatch() {
        type B = NdArray<f32>;
        let device = Default::default();
        let _net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 1024).init(&device);
    }

    #[test]
    fn test_detnet_try_init_error() {
        type B = NdArray<f32>;
        let device = Default::default();
        let result = DetNetConfig::new([1, 1, 1, 1], 1024).try_init::<B>(&device);
        assert!(matches!(result, Err(DetNetError::ChannelMismatch { .. })));
    }

    #[test]
    fn test_detnet_forward_small() {
        type B = NdArray<f32>;
        let device = Default::default();

        let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512).init(&device);
        assert_eq!(net.in_channels(), 4);
        assert_eq!(net.num_outputs(), 10);
        assert_eq!(net.output_resolution([64, 96]), [2, 3]);

        let output = net.forward(Tensor::zeros([2, 4, 64, 96], &device));
        assert_shape_contract!(
            ["batch", "height", "width", "outputs"],
            &output,
            &[("batch", 2), ("height", 2), ("width", 3), ("outputs", 10)],
        );

        let min = output.clone().min().into_scalar();
        let max = output.max().into_scalar();
        assert!(min >= 0.0);
        assert!(max <= 1.0);
    }

    #[test]
    fn test_detnet_forward_autodiff() {
        type B = Autodiff<NdArray<f32>>;
        let device = Default::default();

        let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512)
            .with_in_channels(3)
            .init(&device);

        // Imported parameters must stay trainable.
        let weights = WeightMap::new().with(
            "conv_end.weight",
            TensorData::new(vec![0.01f32; 10 * 256 * 3 * 3], [10, 256, 3, 3]),
        );
        let (net, report) = net.import_state_dict(&weights).unwrap();
        assert_eq!(report.loaded, vec!["conv_end.weight".to_string()]);
        assert!(net.conv_norm_end.conv.weight.is_require_grad());

        let output = net.forward(Tensor::ones([2, 3, 64, 64], &device));
        assert_eq!(output.dims(), [2, 2, 2, 10]);

        let grads = output.sum().backward();
        assert!(net.conv_norm_end.conv.weight.grad(&grads).is_some());
        assert!(net.stem.conv_norm.conv.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_detnet_config_json_round_trip() {
        let config = DetNetConfig::new([3, 4, 6, 3], 2048)
            .with_bottleneck(true)
            .with_in_channels(3);

        let json = serde_json::to_string(&config).unwrap();
        let loaded: DetNetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.to_string(), config.to_string());

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("detnet.json");
        config.save(&path).unwrap();
        let loaded = DetNetConfig::load(&path).unwrap();
        assert_eq!(loaded.in_channels(), 3);
        assert!(loaded.bottleneck);
        loaded.expect_valid();
    }

    #[test]
    fn test_detnet_conv_init_statistics() {
        type B = NdArray<f32>;
        let device = Default::default();

        let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512).init(&device);
        let weights = net.state_dict();

        // Convs carry no bias; only batch norms export one.
        for name in weights.names() {
            if name.ends_with(".bias") {
                let norm = name.contains("bn") || name.contains("downsample.1");
                assert!(norm, "unexpected conv bias {name}");
            }
        }
        assert!(net.conv_norm_end.conv.bias.is_none());
        assert!(net.stem.conv_norm.conv.bias.is_none());

        // 3x3x256 fan-out: std = sqrt(2 / 2304).
        let values = weights
            .get("layer5.0.conv2.weight")
            .unwrap()
            .to_vec::<f32>()
            .unwrap();
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        let expected = (2.0f64 / (3.0 * 3.0 * 256.0)).sqrt();

        assert!(mean.abs() < 0.05 * expected, "mean {mean}");
        assert!(
            (var.sqrt() - expected).abs() < 0.05 * expected,
            "std {} vs {expected}",
            var.sqrt()
        );
    }

    #[test]
    fn test_detnet_state_dict_names() {
        type B = NdArray<f32>;
        let device = Default::default();

        let net: DetNet<B> = DetNetConfig::new([2, 2, 2, 2], 512).init(&device);
        let weights = net.state_dict();

        for name in [
            "conv1.weight",
            "bn1.running_var",
            "layer1.0.conv1.weight",
            "layer1.1.bn2.bias",
            "layer2.0.downsample.0.weight",
            "layer4.1.conv2.weight",
            "layer5.0.downsample.1.bias",
            "layer5.2.conv3.weight",
            "conv_end.weight",
            "bn_end.running_mean",
        ] {
            assert!(weights.contains(name), "missing {name}");
        }
        assert!(!weights.contains("layer1.0.downsample.0.weight"));
        assert!(!weights.contains("conv_end.bias"));
        assert_eq!(weights.get("conv_end.weight").unwrap().shape, vec![10, 256, 3, 3]);
    }

    #[test]
    fn test_detnet_import_state_dict() {
        type B = NdArray<f32>;
        let device = Default::default();

        let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512).init(&device);
        let gamma = TensorData::new(vec![0.5f32; 10], [10]);
        let weights = WeightMap::new()
            .with("bn_end.weight", gamma.clone())
            .with("fc.weight", TensorData::new(vec![0.0f32; 4], [2, 2]));

        let (net, report) = net.import_state_dict(&weights).unwrap();
        assert_eq!(report.loaded, vec!["bn_end.weight".to_string()]);
        assert_eq!(report.skipped, vec!["fc.weight".to_string()]);
        net.conv_norm_end
            .norm
            .gamma
            .val()
            .to_data()
            .assert_eq(&gamma, true);
    }
}
