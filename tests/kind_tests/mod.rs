//! Kind-backed integration tests
//!
//! Tests are organized by the story they tell:
//!
//! - `registry_wiring`: the local registry comes up once and is reused
//!
//! - `environment_lifecycle`: clusters are created, swept and torn down
//!
//! - `manifest_apply`: generated manifests land in a real API server,
//!   including partial failure and re-apply
//!
//! - `go_app`: the full gomodule scenario from clone to a ready Deployment
//!   (slow, ~3-5min)

mod environment_lifecycle;
mod go_app;
mod helpers;
mod manifest_apply;
mod registry_wiring;
