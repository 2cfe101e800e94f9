//! CLI integration tests. Every test runs the binary against an isolated
//! recipe tree and store.

#![cfg(unix)]

mod cache_tests;
mod common;
mod list_tests;
mod run_tests;
