//! End-to-end tests against real kind clusters
//!
//! These need docker, kind and (for the full scenario) the generator binary.
//! They are ignored by default and must run one at a time:
//!
//! ```bash
//! DRAFT_E2E_BIN=/path/to/draft cargo test --test kind -- --ignored --test-threads=1
//! ```
//!
//! Every test creates its own cluster under a test-specific prefix and tears
//! it down when done.

mod kind_tests;
