//! Shared utilities: content hashing and flag sets.

pub(crate) mod flags;
pub mod hash;
