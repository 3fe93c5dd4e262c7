//! Scenario: Environment Overrides
//!
//! # Invariant under test
//! `MESH_*` environment variables override file layers, and unparsable
//! values are ignored rather than failing boot.

use mesh_config::CoreConfig;

#[test]
fn env_overrides_apply_over_defaults() {
    // Single test in this binary: no parallel env mutation hazard.
    std::env::set_var("MESH_MAX_BATCH_ROWS", "77");
    std::env::set_var("MESH_LEASE_SECONDS", "not-a-number");

    let cfg = CoreConfig::default().with_env_overrides();
    assert_eq!(cfg.max_batch_rows, 77);
    assert_eq!(cfg.lease_seconds, 30, "unparsable override is ignored");

    std::env::remove_var("MESH_MAX_BATCH_ROWS");
    std::env::remove_var("MESH_LEASE_SECONDS");
}
