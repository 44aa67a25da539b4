//! # Well-Known Depths
//!
//! | depth     | block counts    | head input | block      |
//! |-----------|-----------------|------------|------------|
//! | resnet18  | ``[2, 2, 2, 2]``  | 512        | basic      |
//! | resnet34  | ``[3, 4, 6, 3]``  | 512        | basic      |
//! | resnet50  | ``[3, 4, 6, 3]``  | 2048       | bottleneck |
//! | resnet101 | ``[3, 4, 23, 3]`` | 2048       | bottleneck |
//! | resnet152 | ``[3, 8, 36, 3]`` | 2048       | bottleneck |

use crate::error::{DetNetError, Result};
use crate::models::detnet::detnet_model::DetNetConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported network depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetNetDepth {
    /// 18 layers, basic blocks.
    ResNet18,

    /// 34 layers, basic blocks.
    ResNet34,

    /// 50 layers, bottleneck blocks.
    ResNet50,

    /// 101 layers, bottleneck blocks.
    ResNet101,

    /// 152 layers, bottleneck blocks.
    ResNet152,
}

impl DetNetDepth {
    /// Every supported depth, shallowest first.
    pub const ALL: [DetNetDepth; 5] = [
        Self::ResNet18,
        Self::ResNet34,
        Self::ResNet50,
        Self::ResNet101,
        Self::ResNet152,
    ];

    /// The canonical name (``resnet18``, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::ResNet50 => "resnet50",
            Self::ResNet101 => "resnet101",
            Self::ResNet152 => "resnet152",
        }
    }

    /// Blocks per residual stage.
    pub fn block_counts(&self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 | Self::ResNet50 => [3, 4, 6, 3],
            Self::ResNet101 => [3, 4, 23, 3],
            Self::ResNet152 => [3, 8, 36, 3],
        }
    }

    /// Does this depth use bottleneck blocks?
    pub fn is_bottleneck(&self) -> bool {
        !matches!(self, Self::ResNet18 | Self::ResNet34)
    }

    /// Input planes of the detection head.
    pub fn head_in_channels(&self) -> usize {
        if self.is_bottleneck() { 2048 } else { 512 }
    }

    /// Build the [`DetNetConfig`] for this depth.
    pub fn to_config(&self) -> DetNetConfig {
        DetNetConfig::new(self.block_counts(), self.head_in_channels())
            .with_bottleneck(self.is_bottleneck())
    }

    fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(|depth| depth.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DetNetDepth {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts ``resnet18`` or a bare ``18``; case-insensitive.
impl FromStr for DetNetDepth {
    type Err = DetNetError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let digits = lower.strip_prefix("resnet").unwrap_or(&lower);
        Self::ALL
            .into_iter()
            .find(|depth| depth.name().strip_prefix("resnet") == Some(digits))
            .ok_or_else(|| DetNetError::UnsupportedDepth {
                requested: s.to_string(),
                supported: Self::supported_names(),
            })
    }
}

impl TryFrom<usize> for DetNetDepth {
    type Error = DetNetError;

    fn try_from(depth: usize) -> Result<Self> {
        depth.to_string().parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detnet::detnet_model::DetNetMeta;
    use hamcrest::prelude::*;

    #[test]
    fn test_depth_configs() {
        let counts: Vec<[usize; 4]> = DetNetDepth::ALL.iter().map(|d| d.block_counts()).collect();
        assert_eq!(
            counts,
            vec![
                [2, 2, 2, 2],
                [3, 4, 6, 3],
                [3, 4, 6, 3],
                [3, 4, 23, 3],
                [3, 8, 36, 3]
            ]
        );

        for depth in DetNetDepth::ALL {
            let config = depth.to_config();
            config.expect_valid();
            assert_eq!(config.bottleneck, depth.is_bottleneck());
            assert_eq!(config.head_in_channels, depth.head_in_channels());
            assert_eq!(config.output_resolution([448, 448]), [14, 14]);
        }
    }

    #[test]
    fn test_depth_parse() {
        assert_eq!("resnet50".parse::<DetNetDepth>().unwrap(), DetNetDepth::ResNet50);
        assert_eq!("ResNet101".parse::<DetNetDepth>().unwrap(), DetNetDepth::ResNet101);
        assert_eq!("152".parse::<DetNetDepth>().unwrap(), DetNetDepth::ResNet152);
        assert_eq!(DetNetDepth::try_from(34).unwrap(), DetNetDepth::ResNet34);

        for depth in DetNetDepth::ALL {
            assert_eq!(depth.to_string().parse::<DetNetDepth>().unwrap(), depth);
        }
    }

    #[test]
    fn test_depth_parse_unsupported() {
        let err = "resnet20".parse::<DetNetDepth>().unwrap_err();
        assert_that!(
            &err.to_string(),
            matches_regex("unsupported configuration: depth 'resnet20'")
        );
        match err {
            DetNetError::UnsupportedDepth { supported, .. } => {
                assert_eq!(supported, "resnet18, resnet34, resnet50, resnet101, resnet152");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(DetNetDepth::try_from(0).is_err());
        assert!("".parse::<DetNetDepth>().is_err());
    }

    #[test]
    fn test_depth_serde() {
        let json = serde_json::to_string(&DetNetDepth::ResNet34).unwrap();
        assert_eq!(json, "\"resnet34\"");
        let depth: DetNetDepth = serde_json::from_str("\"resnet101\"").unwrap();
        assert_eq!(depth, DetNetDepth::ResNet101);
    }
}
