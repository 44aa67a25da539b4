#![warn(missing_docs)]
//!# detnet - Dilated Detection Network
//!
//! A `ResNet` backbone followed by a dilated residual head, producing a
//! ``[batch, 14, 14, 10]`` score grid from a ``[batch, 4, 448, 448]`` input.
//!
//! ## Notable Components
//!
//! * [`cache`] - weight download cache.
//! * [`error`] - [`error::DetNetError`].
//! * [`layers`] - reusable neural network modules.
//!   * [`layers::conv_norm`] - ``Conv2d + BatchNorm2d`` block.
//! * [`models`] - complete models.
//!   * [`models::detnet`] - `DetNet`.
//!     * [`models::detnet::prefabs::DetNetDepth`] - the well-known depths.
//!     * [`models::detnet::pretrained`] - ``torchvision`` backbone weights.
//! * [`options`] - [`options::TrackerOptions`], the tracker option record.
//! * [`weights`] - named weight maps, checkpoint readers and import.

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

pub mod cache;
pub mod error;
pub mod layers;
pub mod models;
pub mod options;
pub mod weights;
