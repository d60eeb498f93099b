//! Scans a shard directory for `forward_<i>.bin` / `forward_<i>_json.json`
//! pairs: an on-disk layout opaque to the core engine but needed to drive
//! it end to end.

use std::fs;
use std::path::{Path, PathBuf};

/// One matched shard: a context binary paired with its graph-metadata JSON.
#[derive(Debug, Clone)]
pub struct Shard {
    pub index: usize,
    pub bin_path: PathBuf,
    pub json_path: PathBuf,
}

/// Find every `forward_<i>.bin` in `ctx_dir` that has a matching
/// `forward_<i>_json.json` sibling, sorted by `<i>`.
pub fn scan(ctx_dir: &Path) -> std::io::Result<Vec<Shard>> {
    let mut bins = Vec::new();
    let mut jsons = std::collections::HashMap::new();

    for entry in fs::read_dir(ctx_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("forward_") {
            continue;
        }
        if let Some(stem) = name.strip_suffix("_json.json") {
            if let Some(index) = stem.strip_prefix("forward_").and_then(|s| s.parse().ok()) {
                jsons.insert(index, path.clone());
                continue;
            }
        }
        if let Some(stem) = name.strip_suffix(".bin") {
            if let Some(index) = stem.strip_prefix("forward_").and_then(|s| s.parse().ok()) {
                bins.push((index, path.clone()));
            }
        }
    }

    let mut shards: Vec<Shard> = bins
        .into_iter()
        .filter_map(|(index, bin_path)| {
            jsons.get(&index).map(|json_path| Shard {
                index,
                bin_path,
                json_path: json_path.clone(),
            })
        })
        .collect();
    shards.sort_by_key(|s| s.index);
    Ok(shards)
}
