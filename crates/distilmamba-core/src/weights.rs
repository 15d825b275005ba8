//! Safetensors weight I/O for `VarMap`-backed models.
//!
//! Two loading modes exist:
//!
//! * [`load_pretrained`] copies Hugging Face weights into the variables under
//!   a key prefix. Every such variable must be present in the files; file
//!   entries with no matching variable are ignored (tied heads, buffers).
//! * [`load_checkpoint`] restores a checkpoint written by
//!   [`save_checkpoint`]. Key sets must match exactly.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Resolve the safetensors files of a model directory.
///
/// Prefers the shards listed in `model.safetensors.index.json`, then a single
/// `model.safetensors`.
pub fn collect_safetensor_paths(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let json = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Value = serde_json::from_str(&json)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        shards.sort();
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    Err(CoreError::Config {
        field: "model_dir".to_string(),
        reason: format!("No safetensors weights found in {}", dir.display()),
    })
}

fn snapshot_vars(varmap: &VarMap) -> CoreResult<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn assign(var: &Var, name: &str, tensor: &Tensor) -> CoreResult<()> {
    if tensor.dims() != var.dims() {
        return Err(CoreError::Config {
            field: name.to_string(),
            reason: format!("shape mismatch: model has {:?}, file has {:?}", var.dims(), tensor.dims()),
        });
    }
    let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
    var.set(&tensor)?;
    Ok(())
}

/// Copy pretrained weights into every variable whose key starts with
/// `prefix`. The file key is the variable key with `prefix` stripped.
///
/// Returns the number of tensors assigned.
pub fn load_pretrained(varmap: &VarMap, prefix: &str, paths: &[PathBuf]) -> CoreResult<usize> {
    let vars = snapshot_vars(varmap)?;
    let device = match vars.first() {
        Some((_, v)) => v.device().clone(),
        None => return Ok(0),
    };

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for path in paths {
        debug!(path = %path.display(), "Reading safetensors shard");
        tensors.extend(candle_core::safetensors::load(path, &device)?);
    }

    let source_desc = paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut loaded = 0usize;
    for (key, var) in vars.iter().filter(|(k, _)| k.starts_with(prefix)) {
        let file_key = &key[prefix.len()..];
        let tensor = tensors.get(file_key).ok_or_else(|| CoreError::MissingWeight {
            name: file_key.to_string(),
            source_desc: source_desc.clone(),
        })?;
        assign(var, key, tensor)?;
        loaded += 1;
    }

    info!(loaded, ignored = tensors.len().saturating_sub(loaded), "Pretrained weights loaded");
    Ok(loaded)
}

/// Write every variable of `varmap` to a safetensors checkpoint.
pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    varmap.save(path)?;
    debug!(path = %path.display(), "Checkpoint written");
    Ok(())
}

/// Restore a checkpoint, requiring the file to hold exactly the model's keys.
pub fn load_checkpoint(varmap: &VarMap, path: &Path) -> CoreResult<()> {
    let vars = snapshot_vars(varmap)?;
    let device = match vars.first() {
        Some((_, v)) => v.device().clone(),
        None => candle_core::Device::Cpu,
    };
    let tensors = candle_core::safetensors::load(path, &device)?;

    let model_keys: BTreeSet<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
    let file_keys: BTreeSet<&str> = tensors.keys().map(String::as_str).collect();
    let missing: Vec<String> = model_keys.difference(&file_keys).map(|k| k.to_string()).collect();
    let unexpected: Vec<String> = file_keys.difference(&model_keys).map(|k| k.to_string()).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(CoreError::CheckpointMismatch { missing, unexpected });
    }

    for (key, var) in &vars {
        assign(var, key, &tensors[key.as_str()])?;
    }
    info!(path = %path.display(), tensors = vars.len(), "Checkpoint loaded");
    Ok(())
}
