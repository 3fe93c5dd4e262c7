//! mesh-daemon library surface.
//!
//! `main.rs` is intentionally thin; the router and shared state live here so
//! the scenario tests in `tests/` can compose the bare router in-process.

pub mod api_types;
pub mod routes;
pub mod state;
