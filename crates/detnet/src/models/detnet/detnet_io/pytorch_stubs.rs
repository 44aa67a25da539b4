#![allow(missing_docs)]
//! # ``torchvision`` ResNet Checkpoint Stubs.
//!
//! `burn-import` loads ``.pth`` and ``.safetensors`` files into typed records.
//! These stub modules mirror the ``torchvision`` ResNet checkpoint layout; the
//! loaded record is then flattened into a [`WeightMap`] under the original
//! state-dict names.
//!
//! Classifier weights (``fc.*``) and ``num_batches_tracked`` counters have no
//! stub field and are dropped by the loader.
use crate::error::{DetNetError, Result};
use crate::models::detnet::util::join_path;
use crate::weights::WeightMap;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dRecord};
use burn::nn::{BatchNorm, BatchNormRecord};
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs as PyTorchLoadArgs, PyTorchFileRecorder};
use burn_import::safetensors::{LoadArgs as SafetensorsLoadArgs, SafetensorsFileRecorder};
use std::path::PathBuf;

/// ``torch.nn.Sequential`` index names of the projection shortcut, mapped to
/// the [`DownsampleStub`] field names.
const DOWNSAMPLE_KEY_REMAPS: [(&str, &str); 2] = [
    (r"downsample\.0", "downsample.conv"),
    (r"downsample\.1", "downsample.bn"),
];

/// Load a ``torchvision`` ResNet ``.pth`` checkpoint as a [`WeightMap`].
pub fn load_pytorch_weight_map<B: Backend>(
    path: PathBuf,
    device: &B::Device,
) -> Result<WeightMap> {
    let record = load_resnet_stub_record::<B>(path.clone(), device)?;
    let weights = record.into_weight_map();
    tracing::info!(path = %path.display(), tensors = weights.len(), "loaded pytorch checkpoint");
    Ok(weights)
}

/// Load a ``torchvision`` ResNet ``.safetensors`` checkpoint as a [`WeightMap`].
pub fn load_safetensors_weight_map<B: Backend>(
    path: PathBuf,
    device: &B::Device,
) -> Result<WeightMap> {
    let record = load_resnet_stub_safetensors_record::<B>(path.clone(), device)?;
    let weights = record.into_weight_map();
    tracing::info!(path = %path.display(), tensors = weights.len(), "loaded safetensors checkpoint");
    Ok(weights)
}

/// Load a [`ResNetStubRecord`] from a ``torch`` weights path.
pub fn load_resnet_stub_record<B: Backend>(
    path: PathBuf,
    device: &B::Device,
) -> Result<ResNetStubRecord<B>> {
    let display = path.display().to_string();
    let load_args = DOWNSAMPLE_KEY_REMAPS
        .into_iter()
        .fold(PyTorchLoadArgs::new(path), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });

    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .map_err(|err| DetNetError::WeightLoad {
            path: display,
            reason: err.to_string(),
        })
}

/// Load a [`ResNetStubRecord`] from a ``.safetensors`` weights path.
pub fn load_resnet_stub_safetensors_record<B: Backend>(
    path: PathBuf,
    device: &B::Device,
) -> Result<ResNetStubRecord<B>> {
    let display = path.display().to_string();
    let load_args = DOWNSAMPLE_KEY_REMAPS
        .into_iter()
        .fold(SafetensorsLoadArgs::new(path), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });

    SafetensorsFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .map_err(|err| DetNetError::WeightLoad {
            path: display,
            reason: err.to_string(),
        })
}

fn export_conv<B: Backend>(
    out: &mut WeightMap,
    prefix: &str,
    record: Conv2dRecord<B>,
) {
    out.insert(join_path(prefix, "weight"), record.weight.val().into_data());
    if let Some(bias) = record.bias {
        out.insert(join_path(prefix, "bias"), bias.val().into_data());
    }
}

fn export_bn<B: Backend>(
    out: &mut WeightMap,
    prefix: &str,
    record: BatchNormRecord<B, 2>,
) {
    out.insert(join_path(prefix, "weight"), record.gamma.val().into_data());
    out.insert(join_path(prefix, "bias"), record.beta.val().into_data());
    out.insert(
        join_path(prefix, "running_mean"),
        record.running_mean.val().into_data(),
    );
    out.insert(
        join_path(prefix, "running_var"),
        record.running_var.val().into_data(),
    );
}

#[derive(Module, Debug)]
pub struct ResNetStub<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub layer1: Vec<ResidualBlockStub<B>>,
    pub layer2: Vec<ResidualBlockStub<B>>,
    pub layer3: Vec<ResidualBlockStub<B>>,
    pub layer4: Vec<ResidualBlockStub<B>>,
}

impl<B: Backend> ResNetStubRecord<B> {
    /// Flatten into state-dict names.
    pub fn into_weight_map(self) -> WeightMap {
        let mut out = WeightMap::new();
        export_conv(&mut out, "conv1", self.conv1);
        export_bn(&mut out, "bn1", self.bn1);
        for (name, layer) in [
            ("layer1", self.layer1),
            ("layer2", self.layer2),
            ("layer3", self.layer3),
            ("layer4", self.layer4),
        ] {
            for (idx, block) in layer.into_iter().enumerate() {
                block.export(&mut out, &format!("{name}.{idx}"));
            }
        }
        out
    }
}

#[derive(Module, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ResidualBlockStub<B: Backend> {
    Bottleneck(BottleneckStub<B>),
    Basic(BasicBlockStub<B>),
}

impl<B: Backend> ResidualBlockStubRecord<B> {
    fn export(
        self,
        out: &mut WeightMap,
        prefix: &str,
    ) {
        match self {
            Self::Basic(stub) => stub.export(out, prefix),
            Self::Bottleneck(stub) => stub.export(out, prefix),
        }
    }
}

#[derive(Module, Debug)]
pub struct DownsampleStub<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> DownsampleStubRecord<B> {
    fn export(
        self,
        out: &mut WeightMap,
        prefix: &str,
    ) {
        export_conv(out, &join_path(prefix, "0"), self.conv);
        export_bn(out, &join_path(prefix, "1"), self.bn);
    }
}

#[derive(Module, Debug)]
pub struct BasicBlockStub<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub downsample: Option<DownsampleStub<B>>,
}

impl<B: Backend> BasicBlockStubRecord<B> {
    fn export(
        self,
        out: &mut WeightMap,
        prefix: &str,
    ) {
        export_conv(out, &join_path(prefix, "conv1"), self.conv1);
        export_bn(out, &join_path(prefix, "bn1"), self.bn1);
        export_conv(out, &join_path(prefix, "conv2"), self.conv2);
        export_bn(out, &join_path(prefix, "bn2"), self.bn2);
        if let Some(downsample) = self.downsample {
            downsample.export(out, &join_path(prefix, "downsample"));
        }
    }
}

#[derive(Module, Debug)]
pub struct BottleneckStub<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<DownsampleStub<B>>,
}

impl<B: Backend> BottleneckStubRecord<B> {
    fn export(
        self,
        out: &mut WeightMap,
        prefix: &str,
    ) {
        export_conv(out, &join_path(prefix, "conv1"), self.conv1);
        export_bn(out, &join_path(prefix, "bn1"), self.bn1);
        export_conv(out, &join_path(prefix, "conv2"), self.conv2);
        export_bn(out, &join_path(prefix, "bn2"), self.bn2);
        export_conv(out, &join_path(prefix, "conv3"), self.conv3);
        export_bn(out, &join_path(prefix, "bn3"), self.bn3);
        if let Some(downsample) = self.downsample {
            downsample.export(out, &join_path(prefix, "downsample"));
        }
    }
}
