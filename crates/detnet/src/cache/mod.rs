//! # Weight Download Cache
//!
//! * [`disk`] - the on-disk cache layout and read-through downloads.
//! * [`weights`] - named pretrained weight sources.

pub mod disk;
pub mod weights;
