//! # `DetNet`
//!
//! A `ResNet` backbone (stem plus four residual stages) followed by a head of
//! dilated residual blocks, projected to a per-cell score grid.
//!
//! * [`detnet_model`] - [`detnet_model::DetNetConfig`] and [`detnet_model::DetNet`].
//! * [`prefabs`] - the well-known depths.
//! * [`pretrained`] - ``torchvision`` backbone weights.

pub mod basic_block;
pub mod bottleneck_block;
pub mod detnet_io;
pub mod detnet_model;
pub mod dilated_block;
pub mod downsample;
pub mod head;
pub mod prefabs;
pub mod pretrained;
pub mod residual_block;
pub mod stage;
pub mod stem;
pub mod util;
