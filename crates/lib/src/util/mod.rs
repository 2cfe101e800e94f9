//! Content hashing shared by fingerprints, recipe revisions and the artifact
//! cache, plus fixtures for the crate's tests.

pub mod hash;

#[cfg(test)]
pub mod testutil;
