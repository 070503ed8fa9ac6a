//! Architectural Enforcement Integration Tests
//!
//! Source-level checks for rules the compiler cannot enforce:
//! - Request resolution stays synchronous and I/O-free
//! - Library code propagates errors instead of panicking
//!
//! The helpers here locate workspace sources and strip test modules and
//! comments so the checks only look at production code.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, resolved from this crate's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// All `.rs` files under `dir` (relative to the workspace root)
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Production lines of a source file as `(line_number, code)`.
///
/// Stops at the first `#[cfg(test)]`, skips comment lines and drops
/// trailing `//` comments.
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let mut lines = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = match line.find(" // ") {
            Some(pos) => &line[..pos],
            None => line,
        };
        lines.push((idx + 1, code.to_string()));
    }
    lines
}

/// Lines in `files` containing any of `patterns`, formatted as
/// `path:line - pattern: code`
pub fn find_violations(files: &[PathBuf], patterns: &[&str]) -> Vec<String> {
    let root = workspace_root();
    let mut violations = Vec::new();
    for path in files {
        let shown = path.strip_prefix(&root).unwrap_or(path);
        for (number, code) in production_lines(path) {
            for pattern in patterns {
                if code.contains(pattern) {
                    violations.push(format!(
                        "{}:{} - {}: {}",
                        shown.display(),
                        number,
                        pattern,
                        code.trim()
                    ));
                }
            }
        }
    }
    violations
}
