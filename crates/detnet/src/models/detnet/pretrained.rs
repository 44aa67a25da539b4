//! # Pretrained Backbone Weights
//!
//! The ``torchvision`` ImageNet ResNet checkpoints share the backbone names
//! of [`DetNet`] (``conv1``, ``bn1``, ``layer1`` .. ``layer4``); the head and
//! output projection have no pretrained counterpart and keep their
//! initialization.
//!
//! The torchvision stem is 3-channel; a 4-channel [`DetNet`] rejects its
//! ``conv1.weight`` with a shape mismatch. Drop those entries with
//! [`WeightMap::retain`] before importing, or build with ``in_channels = 3``.

use crate::cache::disk::DiskCacheConfig;
use crate::cache::weights::{StaticPretrainedWeightsDescriptor, WeightSourceMap};
use crate::error::Result;
use crate::models::detnet::detnet_io::pytorch_stubs::{
    load_pytorch_weight_map, load_safetensors_weight_map,
};
use crate::models::detnet::detnet_model::DetNet;
use crate::weights::WeightMap;
use crate::weights::import::ImportReport;
use burn::module::Module;
use burn::prelude::Backend;
use std::path::Path;

/// `ResNet-18` pretrained on `ImageNet`.
pub static RESNET18_TORCHVISION: StaticPretrainedWeightsDescriptor =
    StaticPretrainedWeightsDescriptor {
        name: "resnet18",
        description: "ResNet-18 pretrained on ImageNet",
        license: Some("bsd-3-clause"),
        origin: Some("https://github.com/pytorch/vision"),
        urls: &["https://download.pytorch.org/models/resnet18-5c106cde.pth"],
    };

/// `ResNet-34` pretrained on `ImageNet`.
pub static RESNET34_TORCHVISION: StaticPretrainedWeightsDescriptor =
    StaticPretrainedWeightsDescriptor {
        name: "resnet34",
        description: "ResNet-34 pretrained on ImageNet",
        license: Some("bsd-3-clause"),
        origin: Some("https://github.com/pytorch/vision"),
        urls: &["https://download.pytorch.org/models/resnet34-333f7ec4.pth"],
    };

/// `ResNet-50` pretrained on `ImageNet`.
pub static RESNET50_TORCHVISION: StaticPretrainedWeightsDescriptor =
    StaticPretrainedWeightsDescriptor {
        name: "resnet50",
        description: "ResNet-50 pretrained on ImageNet",
        license: Some("bsd-3-clause"),
        origin: Some("https://github.com/pytorch/vision"),
        urls: &["https://download.pytorch.org/models/resnet50-19c8e357.pth"],
    };

/// `ResNet-101` pretrained on `ImageNet`.
pub static RESNET101_TORCHVISION: StaticPretrainedWeightsDescriptor =
    StaticPretrainedWeightsDescriptor {
        name: "resnet101",
        description: "ResNet-101 pretrained on ImageNet",
        license: Some("bsd-3-clause"),
        origin: Some("https://github.com/pytorch/vision"),
        urls: &["https://download.pytorch.org/models/resnet101-5d3b4d8f.pth"],
    };

/// `ResNet-152` pretrained on `ImageNet`.
pub static RESNET152_TORCHVISION: StaticPretrainedWeightsDescriptor =
    StaticPretrainedWeightsDescriptor {
        name: "resnet152",
        description: "ResNet-152 pretrained on ImageNet",
        license: Some("bsd-3-clause"),
        origin: Some("https://github.com/pytorch/vision"),
        urls: &["https://download.pytorch.org/models/resnet152-b121ed2d.pth"],
    };

/// The ``torchvision`` ImageNet checkpoints, keyed by depth name.
pub fn default_weight_sources() -> WeightSourceMap {
    [
        &RESNET18_TORCHVISION,
        &RESNET34_TORCHVISION,
        &RESNET50_TORCHVISION,
        &RESNET101_TORCHVISION,
        &RESNET152_TORCHVISION,
    ]
    .into_iter()
    .collect()
}

/// Read a checkpoint file into a [`WeightMap`].
///
/// ``.safetensors`` files use the safetensors recorder; anything else is read
/// as a ``torch`` pickle. Either must follow the ``torchvision`` ResNet layout.
pub fn load_weight_file<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> Result<WeightMap> {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => load_safetensors_weight_map::<B>(path.to_path_buf(), device),
        _ => load_pytorch_weight_map::<B>(path.to_path_buf(), device),
    }
}

/// Resolve a named source, read-through the disk cache, and parse it.
pub fn fetch_pretrained_weights<B: Backend>(
    name: &str,
    sources: &WeightSourceMap,
    disk_cache: &DiskCacheConfig,
    device: &B::Device,
) -> anyhow::Result<WeightMap> {
    let descriptor = sources.try_lookup_by_name(name)?;
    let path = descriptor.fetch_weights_to_disk_cache(disk_cache)?;
    Ok(load_weight_file::<B, _>(path, device)?)
}

/// Fetch a named source and import it into `net`.
pub fn load_pretrained<B: Backend>(
    net: DetNet<B>,
    name: &str,
    sources: &WeightSourceMap,
    disk_cache: &DiskCacheConfig,
) -> anyhow::Result<(DetNet<B>, ImportReport)> {
    let device = net.devices().first().cloned().unwrap_or_default();
    let weights = fetch_pretrained_weights::<B>(name, sources, disk_cache, &device)?;
    let (net, report) = net.import_state_dict(&weights)?;
    tracing::info!(
        source = name,
        loaded = report.loaded.len(),
        skipped = report.skipped.len(),
        missing = report.missing.len(),
        "imported pretrained weights"
    );
    Ok((net, report))
}
