use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::HASH_CONFIG_FILENAME;
use crate::engines::Engine;

/// Optional per-module override of the filename patterns used for hashing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct HashConfig {
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

/// Compute the content hash of a module directory: files are filtered by
/// include/exclude glob patterns (engine defaults, overridden by the
/// module's `hash-config.json`), visited in sorted path order, and hashed
/// by relative path plus byte content. Two equivalent trees in two
/// checkouts produce the same hash.
pub fn module_hash(module_dir: &Path, engine: &dyn Engine) -> Result<String> {
    let (included, excluded) = filename_patterns(module_dir, engine);
    let included: Vec<Regex> = included.iter().map(|p| pattern_to_regex(p)).collect();
    let excluded: Vec<Regex> = excluded.iter().map(|p| pattern_to_regex(p)).collect();

    let mut hasher = Sha256::new();
    hash_dir(module_dir, module_dir, &included, &excluded, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_dir(
    root: &Path,
    dir: &Path,
    included: &[Regex],
    excluded: &[Regex],
    hasher: &mut Sha256,
) -> Result<()> {
    let mut entries: Vec<std::path::PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            hash_dir(root, &path, included, excluded, hasher)?;
            continue;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let is_included = included.iter().any(|expr| expr.is_match(&file_name));
        let is_excluded = excluded.iter().any(|expr| expr.is_match(&file_name));
        if !is_included || is_excluded || file_name == HASH_CONFIG_FILENAME {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(relative.to_string_lossy().as_bytes());
        let content = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        hasher.update(&content);
    }
    Ok(())
}

/// Resolve the include/exclude patterns for a module: the engine defaults,
/// unless a valid `hash-config.json` overrides them. An unreadable or
/// malformed file falls back to the defaults.
fn filename_patterns(module_dir: &Path, engine: &dyn Engine) -> (Vec<String>, Vec<String>) {
    let mut included = engine.default_included_patterns();
    let mut excluded = engine.default_excluded_patterns();
    let config_path = module_dir.join(HASH_CONFIG_FILENAME);
    match std::fs::read(&config_path) {
        Ok(body) => match serde_json::from_slice::<HashConfig>(&body) {
            Ok(config) => {
                if let Some(patterns) = config.include {
                    included = patterns;
                }
                if let Some(patterns) = config.exclude {
                    excluded = patterns;
                }
                debug!(
                    module_dir = %module_dir.display(),
                    "Using hash patterns from hash-config.json"
                );
            }
            Err(_) => {
                debug!(
                    module_dir = %module_dir.display(),
                    "hash-config.json is invalid, using engine defaults"
                );
            }
        },
        Err(_) => {}
    }
    (included, excluded)
}

/// Filename patterns match case-insensitively with `*` as the wildcard.
fn pattern_to_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(&pattern.to_lowercase()).replace("\\*", ".*");
    Regex::new(&format!("^{}$", escaped)).expect("escaped pattern is a valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::builtin_engines;

    fn shell_engine() -> std::sync::Arc<dyn Engine> {
        builtin_engines().get("shell").unwrap().clone()
    }

    #[test]
    fn hash_is_stable_across_checkouts() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [a.path(), b.path()] {
            std::fs::write(dir.join("run.sh"), "echo hello\n").unwrap();
            std::fs::create_dir(dir.join("lib")).unwrap();
            std::fs::write(dir.join("lib").join("util.sh"), "true\n").unwrap();
        }
        let engine = shell_engine();
        let hash_a = module_hash(a.path(), engine.as_ref()).unwrap();
        let hash_b = module_hash(b.path(), engine.as_ref()).unwrap();
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo one\n").unwrap();
        let engine = shell_engine();
        let before = module_hash(dir.path(), engine.as_ref()).unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo two\n").unwrap();
        let after = module_hash(dir.path(), engine.as_ref()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn hash_config_excludes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "draft\n").unwrap();
        let engine = shell_engine();
        let with_notes = module_hash(dir.path(), engine.as_ref()).unwrap();
        std::fs::write(
            dir.path().join(HASH_CONFIG_FILENAME),
            r#"{"Exclude": ["*.md"]}"#,
        )
        .unwrap();
        let without_notes = module_hash(dir.path(), engine.as_ref()).unwrap();
        assert_ne!(with_notes, without_notes);

        // The excluded file no longer affects the hash.
        std::fs::write(dir.path().join("notes.md"), "edited\n").unwrap();
        let edited = module_hash(dir.path(), engine.as_ref()).unwrap();
        assert_eq!(without_notes, edited);
    }
}
