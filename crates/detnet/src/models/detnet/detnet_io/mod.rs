//! # Checkpoint Readers

pub mod pytorch_stubs;
