//! Common low-level modules shared by the network blocks.
pub mod conv_norm;
