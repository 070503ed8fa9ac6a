//! Integration Test: Resolution Path Purity
//!
//! **Policy**: Resolving a request is an in-memory decision. The balancer,
//! health tracker, metrics and router modules MUST NOT await, sleep or
//! perform I/O. Only the prober and the topology manager touch backends.

use architectural_enforcement::{find_violations, rust_files, workspace_root};

const RESOLUTION_MODULES: &[&str] = &[
    "routemate/core/src/routing/balancer.rs",
    "routemate/core/src/routing/health.rs",
    "routemate/core/src/routing/metrics.rs",
    "routemate/core/src/routing/router.rs",
];

const FORBIDDEN: &[&str] = &[
    "async fn",
    ".await",
    "sleep(",
    "block_on(",
    "std::fs",
    "std::net",
    "tokio::net",
    "tokio::fs",
];

#[test]
fn test_resolution_modules_exist() {
    let root = workspace_root();
    for module in RESOLUTION_MODULES {
        assert!(root.join(module).exists(), "missing {module}");
    }
}

#[test]
fn test_resolution_path_is_synchronous() {
    let files: Vec<_> = RESOLUTION_MODULES
        .iter()
        .map(|m| workspace_root().join(m))
        .collect();
    let violations = find_violations(&files, FORBIDDEN);

    if !violations.is_empty() {
        eprintln!("\nResolution path must stay synchronous and I/O-free:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!("Found {} violation(s) on the resolution path", violations.len());
    }
}

#[test]
fn test_no_thread_sleep_in_library() {
    let violations = find_violations(&rust_files("routemate/core/src"), &["std::thread::sleep"]);
    assert!(
        violations.is_empty(),
        "Blocking sleeps in library code:\n{}",
        violations.join("\n")
    );
}
