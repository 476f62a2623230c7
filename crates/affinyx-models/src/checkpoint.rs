//! Versioned checkpoint files.
//!
//! A checkpoint is a safetensors file mapping parameter names to tensors,
//! with string metadata describing where it came from. Files written by older
//! releases are brought up to [`FORMAT_VERSION`] by [`upgrade`] before they are
//! loaded into a model.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use affinyx_common::ModelOpt;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use tracing::{debug, warn};

use crate::{ModelError, Result};

/// Current on-disk layout.
///
/// * 0: bare tensors, no metadata, data-parallel `module.` prefixes possible
/// * 1: metadata added, flat legacy parameter names
/// * 2: parameters grouped under `lig_branch.`, `pro_branch.` and the head
pub const FORMAT_VERSION: u32 = 2;

/// Parameter name -> tensor, ordered for stable output.
pub type StateDict = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub epoch: Option<usize>,
    pub metric: Option<f64>,
    pub model_key: Option<String>,
    pub model: Option<ModelOpt>,
}

impl CheckpointMeta {
    pub fn new(model_key: &str, model: ModelOpt, epoch: Option<usize>, metric: Option<f64>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            epoch,
            metric,
            model_key: Some(model_key.to_string()),
            model: Some(model),
        }
    }

    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("format_version".to_string(), self.format_version.to_string());
        if let Some(epoch) = self.epoch {
            map.insert("epoch".to_string(), epoch.to_string());
        }
        if let Some(metric) = self.metric {
            map.insert("metric".to_string(), metric.to_string());
        }
        if let Some(key) = &self.model_key {
            map.insert("model_key".to_string(), key.clone());
        }
        if let Some(model) = self.model {
            map.insert("model".to_string(), model.to_string());
        }
        map
    }

    fn from_map(map: Option<&HashMap<String, String>>) -> Result<Self> {
        let Some(map) = map else {
            return Ok(Self { format_version: 0, epoch: None, metric: None, model_key: None, model: None });
        };
        let parse_err = |field: &str, value: &str| {
            ModelError::Checkpoint(format!("bad {field} '{value}' in checkpoint metadata"))
        };
        let format_version = match map.get("format_version") {
            Some(v) => v.parse().map_err(|_| parse_err("format_version", v))?,
            None => 0,
        };
        let epoch = map
            .get("epoch")
            .map(|v| v.parse().map_err(|_| parse_err("epoch", v)))
            .transpose()?;
        let metric = map
            .get("metric")
            .map(|v| v.parse().map_err(|_| parse_err("metric", v)))
            .transpose()?;
        let model = map
            .get("model")
            .map(|v| v.parse::<ModelOpt>().map_err(|_| parse_err("model", v)))
            .transpose()?;
        Ok(Self {
            format_version,
            epoch,
            metric,
            model_key: map.get("model_key").cloned(),
            model,
        })
    }
}

/// Copy every parameter out of `varmap`.
pub fn snapshot(varmap: &VarMap) -> Result<StateDict> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::Checkpoint("parameter store lock poisoned".into()))?;
    let mut state = StateDict::new();
    for (name, var) in data.iter() {
        state.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(state)
}

/// Sibling path used while a write is in flight.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write `state` to `path` via a `.partial` sibling and a rename, so readers
/// never see a half-written file.
pub fn write_checkpoint(path: &Path, state: &StateDict, meta: &CheckpointMeta) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = partial_path(path);
    safetensors::serialize_to_file(state.iter().map(|(k, v)| (k.as_str(), v)), Some(meta.to_map()), &tmp)?;
    std::fs::rename(&tmp, path)?;
    debug!("Wrote checkpoint {} ({} tensors)", path.display(), state.len());
    Ok(())
}

/// Read a checkpoint of any known format version, without upgrading it.
pub fn read_checkpoint(path: &Path, device: &Device) -> Result<(CheckpointMeta, StateDict)> {
    let buffer = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let meta = CheckpointMeta::from_map(header.metadata().as_ref())?;
    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
    Ok((meta, tensors.into_iter().collect()))
}

/// Flat names used before parameters were grouped per branch.
const LEGACY_PREFIXES: &[(&str, &str)] = &[
    ("pro_conv1.", "pro_branch.conv1."),
    ("pro_conv2.", "pro_branch.conv2."),
    ("pro_conv3.", "pro_branch.conv3."),
    ("pro_fc.0.", "pro_branch.fc1."),
    ("pro_fc.3.", "pro_branch.fc2."),
    ("pro_fc_g1.", "pro_branch.fc1."),
    ("pro_fc_g2.", "pro_branch.fc2."),
    ("mol_conv1.", "lig_branch.conv1."),
    ("mol_conv2.", "lig_branch.conv2."),
    ("mol_conv3.", "lig_branch.conv3."),
    ("mol_fc_g1.", "lig_branch.fc1."),
    ("mol_fc_g2.", "lig_branch.fc2."),
    ("mol_fc_g3.", "lig_branch.fc3."),
    ("mol_fc_g4.", "lig_branch.fc4."),
    ("dense_out.0.", "dense_out.fc1."),
    ("dense_out.3.", "dense_out.fc2."),
    ("dense_out.6.", "dense_out.fc3."),
    ("dense_out.8.", "dense_out.fc4."),
    ("fc1.", "head.fc1."),
    ("fc2.", "head.fc2."),
    ("out.", "head.fc3."),
];

fn rename_legacy(name: &str) -> String {
    let renamed = LEGACY_PREFIXES
        .iter()
        .find(|(from, _)| name.starts_with(from))
        .map(|(from, to)| format!("{to}{}", &name[from.len()..]))
        .unwrap_or_else(|| name.to_string());

    // Convolutions once kept their weight directly instead of in `lin`.
    if let Some(stem) = renamed.strip_suffix(".weight") {
        let last = stem.rsplit('.').next().unwrap_or(stem);
        let is_conv = last
            .strip_prefix("conv")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if is_conv {
            return format!("{stem}.lin.weight");
        }
    }
    renamed
}

/// Bring a state dict written at format `from` up to [`FORMAT_VERSION`].
pub fn upgrade(state: StateDict, from: u32, model: Option<ModelOpt>) -> Result<StateDict> {
    if from > FORMAT_VERSION {
        return Err(ModelError::Checkpoint(format!(
            "checkpoint format {from} is newer than supported format {FORMAT_VERSION}"
        )));
    }
    let mut state = state;
    if from < 1 {
        state = state
            .into_iter()
            .map(|(k, v)| match k.strip_prefix("module.") {
                Some(rest) => (rest.to_string(), v),
                None => (k, v),
            })
            .collect();
    }
    if from < 2 {
        debug!(?model, "Renaming legacy parameter names");
        // chemical LM weights were stored with the model; they are now precomputed features
        let frozen_lm = model.is_some_and(|m| m.uses_ligand_lm());
        let mut renamed = StateDict::new();
        for (k, v) in state {
            if frozen_lm && k.starts_with("model.") {
                continue;
            }
            let new = rename_legacy(&k);
            if renamed.insert(new.clone(), v).is_some() {
                return Err(ModelError::Checkpoint(format!("legacy name {k} collides with {new}")));
            }
        }
        state = renamed;
    }
    Ok(state)
}

/// Copy `state` into the variables of `varmap`. Names and shapes must match
/// exactly; nothing is written unless every parameter checks out.
pub fn load_state(varmap: &VarMap, state: &StateDict) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::Checkpoint("parameter store lock poisoned".into()))?;

    let missing: Vec<&String> = data.keys().filter(|k| !state.contains_key(*k)).collect();
    let unexpected: Vec<&String> = state.keys().filter(|k| !data.contains_key(*k)).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(ModelError::Checkpoint(format!(
            "parameter mismatch: missing {missing:?}, unexpected {unexpected:?}"
        )));
    }
    for (name, var) in data.iter() {
        let t = &state[name];
        if t.dims() != var.dims() {
            return Err(ModelError::Checkpoint(format!(
                "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                t.dims(),
                var.dims()
            )));
        }
    }
    for (name, var) in data.iter() {
        let t = state[name].to_device(var.device())?.to_dtype(var.dtype())?;
        var.set(&t)?;
    }
    Ok(())
}

/// Read, upgrade and load a checkpoint into `varmap`. Returns its metadata.
pub fn load_checkpoint(path: &Path, varmap: &VarMap, model: ModelOpt, device: &Device) -> Result<CheckpointMeta> {
    let (meta, state) = read_checkpoint(path, device)?;
    if let Some(saved) = meta.model {
        if saved != model {
            warn!("Checkpoint {} was written by {saved}, loading into {model}", path.display());
        }
    }
    let state = upgrade(state, meta.format_version, Some(model))?;
    load_state(varmap, &state)?;
    debug!("Loaded checkpoint {} (format {})", path.display(), meta.format_version);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};
    use pretty_assertions::assert_eq;

    fn small_varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "pro_branch.conv1.lin.weight", Init::Const(1.5)).unwrap();
        vb.get_with_hints(3, "dense_out.fc1.bias", Init::Const(-0.5)).unwrap();
        varmap
    }

    fn names(state: &StateDict) -> Vec<&str> {
        state.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_write_read_keeps_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ckpt").join("run.model");
        let varmap = small_varmap();
        let state = snapshot(&varmap).unwrap();
        let meta = CheckpointMeta::new("run", ModelOpt::Gvpl, Some(4), Some(0.25));

        write_checkpoint(&path, &state, &meta).unwrap();
        assert!(!partial_path(&path).exists());

        let (read_meta, read_state) = read_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(read_meta, meta);
        assert_eq!(names(&read_state), names(&state));
    }

    #[test]
    fn test_load_restores_values() {
        let source = small_varmap();
        let state = snapshot(&source).unwrap();

        let target = VarMap::new();
        let vb = VarBuilder::from_varmap(&target, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 3), "pro_branch.conv1.lin.weight", Init::Const(0.0)).unwrap();
        vb.get_with_hints(3, "dense_out.fc1.bias", Init::Const(0.0)).unwrap();

        load_state(&target, &state).unwrap();
        assert_eq!(w.to_vec2::<f32>().unwrap(), vec![vec![1.5; 3]; 2]);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let state = snapshot(&small_varmap()).unwrap();
        let target = VarMap::new();
        let vb = VarBuilder::from_varmap(&target, DType::F32, &Device::Cpu);
        vb.get_with_hints((3, 3), "pro_branch.conv1.lin.weight", Init::Const(0.0)).unwrap();
        vb.get_with_hints(3, "dense_out.fc1.bias", Init::Const(0.0)).unwrap();
        let err = load_state(&target, &state).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_upgrade_from_bare_data_parallel_checkpoint() {
        let t = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let state: StateDict = [
            ("module.pro_conv1.weight", t.clone()),
            ("module.pro_fc.3.bias", t.clone()),
            ("module.dense_out.8.weight", t.clone()),
            ("module.lig_branch.layers.0.message.ws.weight", t.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let upgraded = upgrade(state, 0, Some(ModelOpt::Gvpl)).unwrap();
        assert_eq!(
            names(&upgraded),
            vec![
                "dense_out.fc4.weight",
                "lig_branch.layers.0.message.ws.weight",
                "pro_branch.conv1.lin.weight",
                "pro_branch.fc2.bias",
            ]
        );
    }

    #[test]
    fn test_upgrade_chem_dta_drops_frozen_language_model() {
        let t = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let state: StateDict = [
            ("mol_fc_g3.weight", t.clone()),
            ("mol_fc_g4.bias", t.clone()),
            ("model.h.0.attn.attention.q_proj.weight", t.clone()),
            ("model.wte.weight", t.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let upgraded = upgrade(state, 1, Some(ModelOpt::Cd)).unwrap();
        assert_eq!(names(&upgraded), vec!["lig_branch.fc3.weight", "lig_branch.fc4.bias"]);
    }

    #[test]
    fn test_current_format_is_untouched() {
        let t = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let state: StateDict = [("fc1.weight".to_string(), t)].into_iter().collect();
        let upgraded = upgrade(state, FORMAT_VERSION, None).unwrap();
        assert_eq!(names(&upgraded), vec!["fc1.weight"]);
        assert!(upgrade(StateDict::new(), FORMAT_VERSION + 1, None).is_err());
    }
}
