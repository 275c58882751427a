//! Built-in phase runners.
//!
//! Each runner is a unit struct registered by the default catalog. Runners
//! with richer internal results keep their own types and bridge through
//! [`crate::adapter`]; the rest build a [`crate::observe::RunReport`] directly.
pub mod business;
pub mod cli_approach;
pub mod dependencies;
pub mod docs;
pub mod integration;
pub mod lint;
pub mod performance;
pub mod playbooks;
pub mod smoke;
pub mod standards;
pub mod structure;
pub mod unit;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directories no phase walks into.
pub(crate) const SKIP_DIRS: [&str; 5] = ["node_modules", ".git", "dist", "coverage", "vendor"];

/// Files under `root` whose name satisfies `keep`, sorted, skipping
/// [`SKIP_DIRS`] and any directory named in `extra_skips`.
pub(crate) fn walk_files<F>(root: &Path, extra_skips: &[String], keep: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool,
{
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", path.display()))?;
            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let rel = path
                    .strip_prefix(root)
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                if SKIP_DIRS.contains(&name.as_ref())
                    || extra_skips
                        .iter()
                        .any(|skip| skip.trim_end_matches('/') == name || skip.trim_end_matches('/') == rel)
                {
                    continue;
                }
                stack.push(path);
            } else if file_type.is_file() && keep(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Default, serde::Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// `scripts` from `<dir>/package.json`; empty when the file is absent.
pub(crate) fn package_scripts(dir: &Path) -> Result<BTreeMap<String, String>> {
    let path = dir.join("package.json");
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let manifest: PackageManifest =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(manifest.scripts)
}

/// Package manager implied by the lockfile in `dir`.
pub(crate) fn package_manager(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").is_file() {
        "pnpm"
    } else if dir.join("yarn.lock").is_file() {
        "yarn"
    } else {
        "npm"
    }
}

/// Path relative to `root` for display.
pub(crate) fn display_rel(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
