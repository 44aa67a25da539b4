//! # Named Weight Import / Export
//!
//! [`NamedWeights`] walks a module's parameters under their state-dict names.
//!
//! Import is a best-effort partial load:
//! * source names with no matching parameter are skipped;
//! * parameters with no matching source name keep their current value;
//! * a matching name with a different shape is a fatal
//!   [`DetNetError::WeightShapeMismatch`].

use crate::error::{DetNetError, Result};
use crate::layers::conv_norm::ConvNorm;
use crate::models::detnet::util::join_path;
use crate::weights::WeightMap;
use burn::module::{Param, RunningState};
use burn::nn::BatchNorm;
use burn::nn::conv::Conv2d;
use burn::prelude::{Backend, Tensor, TensorData};
use std::collections::BTreeSet;

/// Summary of a weight import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Parameters overwritten from the source.
    pub loaded: Vec<String>,

    /// Source entries with no matching parameter.
    pub skipped: Vec<String>,

    /// Parameters with no matching source entry.
    pub missing: Vec<String>,
}

/// In-flight state of an import.
#[derive(Debug)]
pub struct ImportSession<'a> {
    weights: &'a WeightMap,
    loaded: BTreeSet<String>,
    missing: Vec<String>,
}

impl<'a> ImportSession<'a> {
    /// Start an import from `weights`.
    pub fn new(weights: &'a WeightMap) -> Self {
        Self {
            weights,
            loaded: BTreeSet::new(),
            missing: Vec::new(),
        }
    }

    /// Build a tensor for parameter `name` from the source, if the source has it.
    ///
    /// # Arguments
    ///
    /// - `name`: the parameter name.
    /// - `current`: the current parameter value; supplies shape and device.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the source has no entry for `name`.
    pub fn take_tensor<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        current: &Tensor<B, D>,
    ) -> Result<Option<Tensor<B, D>>> {
        let Some(data) = self.weights.get(name) else {
            tracing::debug!(name, "no source weight; keeping initial value");
            self.missing.push(name.to_string());
            return Ok(None);
        };

        let expected = current.dims().to_vec();
        if data.shape != expected {
            return Err(DetNetError::WeightShapeMismatch {
                name: name.to_string(),
                expected,
                found: data.shape.clone(),
            });
        }

        let tensor =
            Tensor::<B, D>::from_data(data.clone().convert::<B::FloatElem>(), &current.device());
        tracing::debug!(name, shape = ?expected, "imported weight");
        self.loaded.insert(name.to_string());

        Ok(Some(tensor))
    }

    /// Import a [`Param`] in place.
    ///
    /// The replacement keeps the parameter's gradient tracking.
    pub fn import_param<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        param: Param<Tensor<B, D>>,
    ) -> Result<Param<Tensor<B, D>>> {
        let require_grad = param.is_require_grad();
        match self.take_tensor(name, &param.val())? {
            Some(tensor) => Ok(param.map(move |_| tensor.clone().set_require_grad(require_grad))),
            None => Ok(param),
        }
    }

    /// Import a [`RunningState`] in place.
    pub fn import_running_state<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        state: RunningState<Tensor<B, D>>,
    ) -> Result<RunningState<Tensor<B, D>>> {
        match self.take_tensor(name, &state.value())? {
            Some(tensor) => Ok(RunningState::new(tensor)),
            None => Ok(state),
        }
    }

    /// Finish the import.
    pub fn finish(self) -> ImportReport {
        let skipped: Vec<String> = self
            .weights
            .names()
            .filter(|name| !self.loaded.contains(*name))
            .map(str::to_string)
            .collect();

        for name in &skipped {
            tracing::debug!(name, "skipped source weight with no matching parameter");
        }
        tracing::info!(
            loaded = self.loaded.len(),
            skipped = skipped.len(),
            missing = self.missing.len(),
            "weight import finished"
        );

        ImportReport {
            loaded: self.loaded.into_iter().collect(),
            skipped,
            missing: self.missing,
        }
    }
}

/// Modules whose parameters can be addressed by state-dict name.
pub trait NamedWeights<B: Backend>: Sized {
    /// Export every parameter under `prefix` into `out`.
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    );

    /// Import matching parameters under `prefix`, consuming and returning the module.
    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> Result<Self>;
}

fn export_tensor<B: Backend, const D: usize>(
    out: &mut WeightMap,
    name: String,
    tensor: Tensor<B, D>,
) {
    let data: TensorData = tensor.into_data();
    out.insert(name, data);
}

impl<B: Backend> NamedWeights<B> for Conv2d<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        export_tensor(out, join_path(prefix, "weight"), self.weight.val());
        if let Some(bias) = &self.bias {
            export_tensor(out, join_path(prefix, "bias"), bias.val());
        }
    }

    fn import_weights(
        mut self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> Result<Self> {
        self.weight = session.import_param(&join_path(prefix, "weight"), self.weight)?;
        self.bias = match self.bias {
            Some(bias) => Some(session.import_param(&join_path(prefix, "bias"), bias)?),
            None => None,
        };
        Ok(self)
    }
}

impl<B: Backend> NamedWeights<B> for BatchNorm<B, 2> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        export_tensor(out, join_path(prefix, "weight"), self.gamma.val());
        export_tensor(out, join_path(prefix, "bias"), self.beta.val());
        export_tensor(
            out,
            join_path(prefix, "running_mean"),
            self.running_mean.value(),
        );
        export_tensor(
            out,
            join_path(prefix, "running_var"),
            self.running_var.value(),
        );
    }

    fn import_weights(
        mut self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> Result<Self> {
        self.gamma = session.import_param(&join_path(prefix, "weight"), self.gamma)?;
        self.beta = session.import_param(&join_path(prefix, "bias"), self.beta)?;
        self.running_mean =
            session.import_running_state(&join_path(prefix, "running_mean"), self.running_mean)?;
        self.running_var =
            session.import_running_state(&join_path(prefix, "running_var"), self.running_var)?;
        Ok(self)
    }
}

/// Export a [`ConvNorm`] whose conv and norm live under sibling names
/// (``conv1`` / ``bn1``).
pub fn export_conv_norm<B: Backend>(
    layer: &ConvNorm<B>,
    conv_path: &str,
    norm_path: &str,
    out: &mut WeightMap,
) {
    layer.conv.export_weights(conv_path, out);
    layer.norm.export_weights(norm_path, out);
}

/// Import a [`ConvNorm`] whose conv and norm live under sibling names
/// (``conv1`` / ``bn1``).
pub fn import_conv_norm<B: Backend>(
    layer: ConvNorm<B>,
    conv_path: &str,
    norm_path: &str,
    session: &mut ImportSession,
) -> Result<ConvNorm<B>> {
    Ok(ConvNorm {
        conv: layer.conv.import_weights(conv_path, session)?,
        norm: layer.norm.import_weights(norm_path, session)?,
    })
}

/// A bare [`ConvNorm`] is addressed as a two-element sequence:
/// ``{prefix}.0`` (conv) and ``{prefix}.1`` (norm).
impl<B: Backend> NamedWeights<B> for ConvNorm<B> {
    fn export_weights(
        &self,
        prefix: &str,
        out: &mut WeightMap,
    ) {
        export_conv_norm(
            self,
            &join_path(prefix, "0"),
            &join_path(prefix, "1"),
            out,
        );
    }

    fn import_weights(
        self,
        prefix: &str,
        session: &mut ImportSession,
    ) -> Result<Self> {
        import_conv_norm(
            self,
            &join_path(prefix, "0"),
            &join_path(prefix, "1"),
            session,
        )
    }
}

/// Export a module's full weight map.
pub fn state_dict<B: Backend, M: NamedWeights<B>>(module: &M) -> WeightMap {
    let mut out = WeightMap::new();
    module.export_weights("", &mut out);
    out
}

/// Import `weights` into a module.
pub fn import_weights<B: Backend, M: NamedWeights<B>>(
    module: M,
    weights: &WeightMap,
) -> Result<(M, ImportReport)> {
    let mut session = ImportSession::new(weights);
    let module = module.import_weights("", &mut session)?;
    Ok((module, session.finish()))
}
