//! Which CLI layout a scenario uses.
//!
//! Cross-platform scenarios ship Go sources plus installers; legacy ones ship
//! a shell entry point named after the scenario. Anything else is unknown and
//! gets a remediation listing the exact files to add.
use std::fs::File;
use std::io::Read;
use std::path::Path;

const SNIFF_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliApproachKind {
    CrossPlatform,
    Legacy,
    Unknown,
}

impl CliApproachKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CliApproachKind::CrossPlatform => "cross-platform",
            CliApproachKind::Legacy => "legacy",
            CliApproachKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliApproach {
    pub kind: CliApproachKind,
    /// Required files absent for the detected layout, relative to the scenario.
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
    pub remediation: Option<String>,
}

impl CliApproach {
    pub fn is_valid(&self) -> bool {
        self.kind != CliApproachKind::Unknown && self.missing.is_empty()
    }
}

/// True when the first 512 bytes contain a NUL.
pub fn is_binary_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = [0u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < SNIFF_BYTES {
        match file.read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    buf[..filled].contains(&0)
}

pub fn detect(scenario_dir: &Path, scenario_name: &str) -> CliApproach {
    let cli = scenario_dir.join("cli");
    let has = |name: &str| cli.join(name).is_file();
    let entry = cli.join(scenario_name);
    let entry_is_binary = entry.is_file() && is_binary_file(&entry);
    let entry_is_text = entry.is_file() && !entry_is_binary;
    let rel = |name: &str| format!("cli/{name}");

    if has("main.go") && (has("go.mod") || entry_is_binary) {
        let missing: Vec<String> = ["main.go", "go.mod", "install.sh"]
            .into_iter()
            .filter(|name| !has(*name))
            .map(rel)
            .collect();
        let mut warnings = Vec::new();
        if !has("install.ps1") {
            warnings.push(format!(
                "{} is recommended so Windows users can install the CLI",
                rel("install.ps1")
            ));
        }
        let remediation = (!missing.is_empty())
            .then(|| format!("Add {} to complete the cross-platform CLI.", missing.join(", ")));
        return CliApproach {
            kind: CliApproachKind::CrossPlatform,
            missing,
            warnings,
            remediation,
        };
    }

    if entry_is_text && has("install.sh") {
        let mut warnings = Vec::new();
        if !crate::command::is_executable(&entry) {
            warnings.push(format!("{} is not executable (chmod +x)", rel(scenario_name)));
        }
        return CliApproach {
            kind: CliApproachKind::Legacy,
            missing: Vec::new(),
            warnings,
            remediation: None,
        };
    }

    let cross_missing: Vec<String> = ["main.go", "go.mod", "install.sh"]
        .into_iter()
        .filter(|name| !has(*name))
        .map(rel)
        .collect();
    let mut legacy_missing = Vec::new();
    if !entry_is_text {
        legacy_missing.push(rel(scenario_name));
    }
    if !has("install.sh") {
        legacy_missing.push(rel("install.sh"));
    }
    let remediation = format!(
        "Add {} for a cross-platform Go CLI, or {} for a legacy shell CLI.",
        cross_missing.join(", "),
        legacy_missing.join(", ")
    );
    CliApproach {
        kind: CliApproachKind::Unknown,
        missing: cross_missing,
        warnings: Vec::new(),
        remediation: Some(remediation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn go_sources_are_cross_platform() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "cli/main.go", b"package main");
        touch(dir.path(), "cli/go.mod", b"module demo");
        touch(dir.path(), "cli/install.sh", b"#!/bin/sh");
        let approach = detect(dir.path(), "demo");
        assert_eq!(approach.kind, CliApproachKind::CrossPlatform);
        assert!(approach.is_valid());
        assert_eq!(approach.warnings.len(), 1, "install.ps1 recommended");
    }

    #[test]
    fn compiled_binary_next_to_main_go_is_cross_platform() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "cli/main.go", b"package main");
        touch(dir.path(), "cli/demo", b"\x7fELF\x02\x01\x01\x00\x00\x00");
        let approach = detect(dir.path(), "demo");
        assert_eq!(approach.kind, CliApproachKind::CrossPlatform);
        assert_eq!(approach.missing, vec!["cli/go.mod", "cli/install.sh"]);
    }

    #[test]
    fn shell_entry_point_is_legacy() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "cli/demo", b"#!/usr/bin/env bash\necho hi\n");
        touch(dir.path(), "cli/install.sh", b"#!/bin/sh");
        let approach = detect(dir.path(), "demo");
        assert_eq!(approach.kind, CliApproachKind::Legacy);
        assert!(approach.is_valid());
        #[cfg(unix)]
        assert!(approach.warnings.iter().any(|w| w.contains("not executable")));
    }

    #[test]
    fn main_go_beside_a_text_entry_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "cli/main.go", b"package main");
        touch(dir.path(), "cli/demo", b"#!/usr/bin/env bash\n");
        touch(dir.path(), "cli/install.sh", b"#!/bin/sh");
        assert_eq!(detect(dir.path(), "demo").kind, CliApproachKind::Legacy);

        touch(dir.path(), "cli/go.mod", b"module demo");
        assert_eq!(detect(dir.path(), "demo").kind, CliApproachKind::CrossPlatform);

        let bare = tempfile::tempdir().expect("tempdir");
        touch(bare.path(), "cli/main.go", b"package main");
        touch(bare.path(), "cli/demo", b"#!/usr/bin/env bash\n");
        assert_eq!(detect(bare.path(), "demo").kind, CliApproachKind::Unknown);
    }

    #[test]
    fn unknown_lists_exact_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "cli/install.sh", b"#!/bin/sh");
        let approach = detect(dir.path(), "demo");
        assert_eq!(approach.kind, CliApproachKind::Unknown);
        let remediation = approach.remediation.expect("remediation");
        assert!(remediation.contains("cli/main.go, cli/go.mod"));
        assert!(remediation.contains("cli/demo"));
        assert!(!remediation.contains("cli/install.sh for a legacy"));
    }

    #[test]
    fn nul_in_first_block_means_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "text", b"plain text");
        touch(dir.path(), "bin", b"ab\0cd");
        assert!(!is_binary_file(&dir.path().join("text")));
        assert!(is_binary_file(&dir.path().join("bin")));
        assert!(!is_binary_file(&dir.path().join("missing")));
    }
}
