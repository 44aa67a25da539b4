//! # Complete Models
//!
//! * [`detnet`] - residual backbone with a dilated detection head.

pub mod detnet;
