use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use serde::Deserialize;

/// Weight file name used by diffusers-style subfolders.
pub(crate) const WEIGHTS_FILE: &str = "diffusion_pytorch_model.safetensors";

/// A model repository, either on disk or on the Hugging Face Hub.
pub(crate) enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    /// A `model_id` naming an existing directory is read from disk, anything
    /// else is treated as a Hub repository id.
    pub(crate) fn resolve(model_id: &str, api: &Api) -> Self {
        let path = Path::new(model_id);
        if path.is_dir() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub(api.model(model_id.to_string()))
        }
    }

    pub(crate) fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(root) => {
                let path = root.join(file);
                if !path.is_file() {
                    bail!("{} does not exist", path.display());
                }
                Ok(path)
            }
            Self::Hub(repo) => repo
                .get(file)
                .with_context(|| format!("failed to fetch {file} from {}", repo.url(file))),
        }
    }

    pub(crate) fn read_to_string(&self, file: &str) -> Result<String> {
        let path = self.get(file)?;
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    /// Safetensors files holding the weights of `subfolder`, following the
    /// shard index when the checkpoint is split.
    pub(crate) fn weight_files(&self, subfolder: &str) -> Result<Vec<PathBuf>> {
        let index_file = format!("{subfolder}/{WEIGHTS_FILE}.index.json");
        match self.read_to_string(&index_file) {
            Ok(index) => shard_names(&index)
                .with_context(|| format!("invalid shard index {index_file}"))?
                .iter()
                .map(|shard| self.get(&format!("{subfolder}/{shard}")))
                .collect(),
            Err(_) => Ok(vec![self.get(&format!("{subfolder}/{WEIGHTS_FILE}"))?]),
        }
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

fn shard_names(index: &str) -> Result<Vec<String>> {
    let index: ShardIndex = serde_json::from_str(index)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        bail!("shard index lists no files");
    }
    Ok(shards.into_iter().collect())
}
