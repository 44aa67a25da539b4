//! # Tracker Options
//!
//! [`TrackerOptions`] is the full option record of the online tracker that
//! drives the detector: sampling, bounding-box regression, initial and
//! online training schedules. Only `backbone` and `pretrained` feed network
//! construction; the rest is carried for the tracker loop.
//!
//! JSON load/save comes from [`Config`]:
//!
//! ```no_run
//! use burn::config::Config;
//! use detnet::options::TrackerOptions;
//!
//! let options = TrackerOptions::new().with_backbone("resnet50".to_string());
//! options.save("tracker.json").unwrap();
//! let options = TrackerOptions::load("tracker.json").unwrap();
//! ```

use crate::cache::disk::DiskCacheConfig;
use crate::cache::weights::WeightSourceMap;
use crate::error::{self, DetNetError};
use crate::models::detnet::detnet_model::{DetNet, DetNetConfig, DetNetMeta};
use crate::models::detnet::prefabs::DetNetDepth;
use crate::models::detnet::pretrained::{default_weight_sources, fetch_pretrained_weights};
use burn::config::Config;
use burn::prelude::Backend;
use std::collections::BTreeMap;

fn default_lr_mult() -> BTreeMap<String, f64> {
    BTreeMap::from([("fc6".to_string(), 10.0)])
}

/// Online tracker options.
#[derive(Config, Debug)]
pub struct TrackerOptions {
    /// Run on an accelerator when one is available.
    #[config(default = true)]
    pub use_gpu: bool,

    /// Path of the tracker's own model checkpoint.
    #[config(default = "\"./models/mdnet_imagenet_vid.pth\".to_string()")]
    pub model_path: String,

    /// Side of the square crop fed to the tracker.
    #[config(default = 107)]
    pub img_size: usize,

    /// Context padding around the crop.
    #[config(default = 16)]
    pub padding: usize,

    /// Positive samples per minibatch.
    #[config(default = 32)]
    pub batch_pos: usize,

    /// Negative samples per minibatch.
    #[config(default = 96)]
    pub batch_neg: usize,

    /// Negative candidates scored for hard-negative mining.
    #[config(default = 1024)]
    pub batch_neg_cand: usize,

    /// Samples per scoring batch.
    #[config(default = 256)]
    pub batch_test: usize,

    /// Candidate boxes drawn per frame.
    #[config(default = 256)]
    pub n_samples: usize,

    /// Translation factor of the candidate sampler.
    #[config(default = 0.6)]
    pub trans_f: f64,

    /// Scale factor of the candidate sampler.
    #[config(default = 1.05)]
    pub scale_f: f64,

    /// Translation factor used after a tracking failure.
    #[config(default = 1.5)]
    pub trans_f_expand: f64,

    /// Samples for the bounding-box regressor.
    #[config(default = 1000)]
    pub n_bbreg: usize,

    /// Overlap range of bounding-box regression samples.
    #[config(default = "[0.6, 1.0]")]
    pub overlap_bbreg: [f64; 2],

    /// Scale range of bounding-box regression samples.
    #[config(default = "[1.0, 2.0]")]
    pub scale_bbreg: [f64; 2],

    /// Learning rate of the initial training.
    #[config(default = 0.0005)]
    pub lr_init: f64,

    /// Iterations of the initial training.
    #[config(default = 30)]
    pub maxiter_init: usize,

    /// Positive samples of the initial training.
    #[config(default = 500)]
    pub n_pos_init: usize,

    /// Negative samples of the initial training.
    #[config(default = 1500)]
    pub n_neg_init: usize,

    /// Overlap range of initial positives.
    #[config(default = "[0.7, 1.0]")]
    pub overlap_pos_init: [f64; 2],

    /// Overlap range of initial negatives.
    #[config(default = "[0.0, 0.5]")]
    pub overlap_neg_init: [f64; 2],

    /// Learning rate of online updates.
    #[config(default = 0.001)]
    pub lr_update: f64,

    /// Iterations per online update.
    #[config(default = 15)]
    pub maxiter_update: usize,

    /// Positive samples per online update.
    #[config(default = 50)]
    pub n_pos_update: usize,

    /// Negative samples per online update.
    #[config(default = 200)]
    pub n_neg_update: usize,

    /// Overlap range of update positives.
    #[config(default = "[0.7, 1.0]")]
    pub overlap_pos_update: [f64; 2],

    /// Overlap range of update negatives.
    #[config(default = "[0.0, 0.3]")]
    pub overlap_neg_update: [f64; 2],

    /// Score threshold of a successful frame.
    #[config(default = 0.0)]
    pub success_thr: f64,

    /// Frames kept for short-term updates.
    #[config(default = 20)]
    pub n_frames_short: usize,

    /// Frames kept for long-term updates.
    #[config(default = 100)]
    pub n_frames_long: usize,

    /// Frames between long-term updates.
    #[config(default = 10)]
    pub long_interval: usize,

    /// Weight decay.
    #[config(default = 0.0005)]
    pub w_decay: f64,

    /// SGD momentum.
    #[config(default = 0.9)]
    pub momentum: f64,

    /// Gradient norm clip.
    #[config(default = 10.0)]
    pub grad_clip: f64,

    /// Learning-rate multipliers, keyed by parameter-name fragment.
    #[config(default = "default_lr_mult()")]
    pub lr_mult: BTreeMap<String, f64>,

    /// Parameter-name fragments trained online.
    #[config(default = "vec![\"fc\".to_string()]")]
    pub ft_layers: Vec<String>,

    /// Detector depth name (``resnet18`` .. ``resnet152``).
    #[config(default = "\"resnet18\".to_string()")]
    pub backbone: String,

    /// Import ``torchvision`` backbone weights on construction.
    #[config(default = false)]
    pub pretrained: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerOptions {
    /// Check value ranges.
    ///
    /// Every ``[lo, hi]`` range must be ordered and every batch size non-zero.
    pub fn validate(&self) -> error::Result<()> {
        for (key, [lo, hi]) in [
            ("overlap_bbreg", self.overlap_bbreg),
            ("scale_bbreg", self.scale_bbreg),
            ("overlap_pos_init", self.overlap_pos_init),
            ("overlap_neg_init", self.overlap_neg_init),
            ("overlap_pos_update", self.overlap_pos_update),
            ("overlap_neg_update", self.overlap_neg_update),
        ] {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(DetNetError::InvalidOption {
                    key: key.to_string(),
                    reason: format!("range [{lo}, {hi}] is not ordered"),
                });
            }
        }

        for (key, size) in [
            ("batch_pos", self.batch_pos),
            ("batch_neg", self.batch_neg),
            ("batch_neg_cand", self.batch_neg_cand),
            ("batch_test", self.batch_test),
        ] {
            if size == 0 {
                return Err(DetNetError::InvalidOption {
                    key: key.to_string(),
                    reason: "batch size must be non-zero".to_string(),
                });
            }
        }

        self.depth().map(|_| ())
    }

    /// Learning-rate multiplier of a parameter.
    ///
    /// The first ``lr_mult`` key contained in `param_name` wins; otherwise ``1.0``.
    pub fn lr_multiplier(
        &self,
        param_name: &str,
    ) -> f64 {
        self.lr_mult
            .iter()
            .find(|(key, _)| param_name.contains(key.as_str()))
            .map_or(1.0, |(_, mult)| *mult)
    }

    /// Is the parameter trained online?
    pub fn is_fine_tuned(
        &self,
        param_name: &str,
    ) -> bool {
        self.ft_layers
            .iter()
            .any(|layer| param_name.contains(layer.as_str()))
    }

    /// The parsed `backbone`.
    pub fn depth(&self) -> error::Result<DetNetDepth> {
        self.backbone.parse()
    }

    /// The [`DetNetConfig`] for `backbone`.
    pub fn detector_config(&self) -> error::Result<DetNetConfig> {
        Ok(self.depth()?.to_config())
    }

    /// Build the detector, using [`default_weight_sources`] and the default
    /// disk cache when `pretrained` is set.
    pub fn init_detector<B: Backend>(
        &self,
        device: &B::Device,
    ) -> anyhow::Result<DetNet<B>> {
        self.init_detector_with(device, &default_weight_sources(), &DiskCacheConfig::default())
    }

    /// Build the detector against an explicit weight registry and cache.
    ///
    /// With `pretrained` set, the backbone weights named by `backbone` are
    /// imported. A stem whose channel count differs from the checkpoint's
    /// keeps its initialization.
    pub fn init_detector_with<B: Backend>(
        &self,
        device: &B::Device,
        sources: &WeightSourceMap,
        disk_cache: &DiskCacheConfig,
    ) -> anyhow::Result<DetNet<B>> {
        self.validate()?;
        let depth = self.depth()?;
        let net: DetNet<B> = depth.to_config().try_init(device)?;
        if !self.pretrained {
            return Ok(net);
        }

        let mut weights = fetch_pretrained_weights::<B>(depth.name(), sources, disk_cache, device)?;
        let stem_channels = weights.get("conv1.weight").map(|w| w.shape[1]);
        if stem_channels.is_some_and(|c| c != net.in_channels()) {
            tracing::info!(
                checkpoint = ?stem_channels,
                stem = net.in_channels(),
                "stem channels differ; keeping stem conv initialization"
            );
            weights.retain(|name| !name.starts_with("conv1."));
        }

        let (net, report) = net.import_state_dict(&weights)?;
        tracing::info!(
            backbone = %depth,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "initialized pretrained detector"
        );
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use hamcrest::prelude::*;

    type B = NdArray<f32>;

    #[test]
    fn test_defaults() {
        let options = TrackerOptions::default();
        assert!(options.use_gpu);
        assert_eq!(options.model_path, "./models/mdnet_imagenet_vid.pth");
        assert_eq!(options.img_size, 107);
        assert_eq!(options.batch_neg_cand, 1024);
        assert_eq!(options.overlap_neg_update, [0.0, 0.3]);
        assert_eq!(options.lr_init, 0.0005);
        assert_eq!(options.grad_clip, 10.0);
        assert_eq!(options.lr_mult.get("fc6"), Some(&10.0));
        assert_eq!(options.ft_layers, vec!["fc".to_string()]);
        assert_eq!(options.backbone, "resnet18");
        assert!(!options.pretrained);

        options.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let err = TrackerOptions::new()
            .with_overlap_pos_init([1.0, 0.7])
            .validate()
            .unwrap_err();
        assert_that!(&err.to_string(), matches_regex("invalid option 'overlap_pos_init'"));

        let err = TrackerOptions::new().with_batch_test(0).validate().unwrap_err();
        assert!(matches!(err, DetNetError::InvalidOption { key, .. } if key == "batch_test"));

        let err = TrackerOptions::new()
            .with_backbone("resnet20".to_string())
            .validate()
            .unwrap_err();
        assert!(matches!(err, DetNetError::UnsupportedDepth { .. }));
    }

    #[test]
    fn test_lr_multiplier_and_fine_tuning() {
        let options = TrackerOptions::new();
        assert_eq!(options.lr_multiplier("fc6.weight"), 10.0);
        assert_eq!(options.lr_multiplier("layer1.0.conv1.weight"), 1.0);

        assert!(options.is_fine_tuned("fc4.weight"));
        assert!(options.is_fine_tuned("fc6.bias"));
        assert!(!options.is_fine_tuned("layer5.0.conv2.weight"));
    }

    #[test]
    fn test_json_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tracker.json");

        let options = TrackerOptions::new()
            .with_backbone("resnet101".to_string())
            .with_pretrained(true)
            .with_lr_update(0.002)
            .with_ft_layers(vec!["fc".to_string(), "layer5".to_string()]);
        options.save(&path).unwrap();

        let loaded = TrackerOptions::load(&path).unwrap();
        assert_eq!(loaded.backbone, "resnet101");
        assert!(loaded.pretrained);
        assert_eq!(loaded.lr_update, 0.002);
        assert_eq!(loaded.ft_layers, options.ft_layers);
        assert_eq!(loaded.lr_mult, options.lr_mult);
        assert_eq!(loaded.detector_config().unwrap().block_counts, [3, 4, 23, 3]);
    }

    #[test]
    fn test_init_detector() {
        let options = TrackerOptions::new().with_backbone("18".to_string());
        let net: DetNet<B> = options.init_detector(&Default::default()).unwrap();
        assert_eq!(net.in_channels(), 4);
        assert_eq!(net.output_resolution([448, 448]), [14, 14]);

        let err = TrackerOptions::new()
            .with_backbone("vgg".to_string())
            .init_detector::<B>(&Default::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetNetError>(),
            Some(DetNetError::UnsupportedDepth { .. })
        ));
    }
}
