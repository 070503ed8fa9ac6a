//! Integration Test: Panic-Free Production Code
//!
//! **Policy**: Library and daemon code propagate errors with `Result` and
//! `?`. `unwrap()`, `expect()` and explicit panics are allowed in tests only.

use architectural_enforcement::{find_violations, rust_files};

const FORBIDDEN: &[&str] = &[
    ".unwrap()",
    ".expect(",
    "panic!(",
    "todo!(",
    "unimplemented!(",
];

#[test]
fn test_no_panics_in_production_code() {
    let mut files = rust_files("routemate/core/src");
    files.extend(rust_files("routemate/daemon/src"));
    assert!(!files.is_empty(), "no sources found under routemate/");

    let violations = find_violations(&files, FORBIDDEN);
    if !violations.is_empty() {
        eprintln!("\nPanicking calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!("Found {} panicking call(s); return errors instead", violations.len());
    }
}
