//! pkgcheck-lib: build-and-verify orchestration for native library recipes.
//!
//! For every recipe and build configuration the harness builds the library,
//! compiles and runs the recipe's smoke-test program against the artifact, and
//! aggregates the outcomes:
//! - `recipe`: loading recipe manifests from a recipe repository
//! - `matrix`: expanding option axes into concrete work units
//! - `cache`: the content-addressed artifact store with build reservation
//! - `execute`: build and verify executors on top of a deadline-aware process runner
//! - `schedule`: the bounded worker pool and cancellation
//! - `report`: outcomes, aggregation, and the final report

pub mod cache;
pub mod config;
pub mod consts;
pub mod execute;
pub mod matrix;
pub mod placeholder;
pub mod platform;
pub mod recipe;
pub mod report;
pub mod schedule;
pub mod store;
pub mod store_lock;
pub mod util;
