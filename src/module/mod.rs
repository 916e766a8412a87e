pub mod hasher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::engines::Engine;

/// One module found under the package directory, bound to its engine and
/// fingerprinted at discovery time.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub engine: String,
    pub dir: PathBuf,
    /// Content hash of the filtered module file set, recomputed every run.
    pub hash: String,
}

/// Discover modules under the package directory. The first directory level
/// selects the engine, the second names the module:
/// `<package_dir>/<engine>/<module>/`. Module names are unique across
/// engines.
pub fn discover_modules(
    package_dir: &Path,
    engines: &BTreeMap<String, Arc<dyn Engine>>,
) -> Result<BTreeMap<String, ModuleInfo>> {
    let mut modules = BTreeMap::new();
    let mut stats: BTreeMap<&str, usize> = BTreeMap::new();
    for (engine_name, engine) in engines {
        let engine_dir = package_dir.join(engine_name);
        if !engine_dir.is_dir() {
            continue;
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&engine_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        entries.sort();
        for dir in entries {
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if modules.contains_key(&name) {
                bail!("The module {} already exists", name);
            }
            let hash = hasher::module_hash(&dir, engine.as_ref())?;
            modules.insert(
                name.clone(),
                ModuleInfo {
                    name,
                    engine: engine_name.clone(),
                    dir,
                    hash,
                },
            );
            *stats.entry(engine.name()).or_insert(0) += 1;
        }
    }
    let summary: Vec<String> = stats
        .iter()
        .map(|(engine, count)| format!("{} {}", count, engine))
        .collect();
    info!(
        modules = modules.len(),
        "Found {} modules in this package ({})",
        modules.len(),
        summary.join(", ")
    );
    Ok(modules)
}
