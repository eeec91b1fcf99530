//! deriva-lib: content-addressed build and cache orchestration.
//!
//! This crate provides:
//! - `build`: immutable build records keyed by content hash, and the job state
//!   machine that resolves, caches and executes them
//! - `cache`: the cache store contract, in-process stores and the layered
//!   store hierarchy
//! - `request`: request ownership, priority and cancellation
//! - `config`: process bootstrap configuration

pub mod buffer;
pub mod build;
pub mod cache;
pub mod config;
pub mod consts;
pub mod paths;
pub mod request;
pub mod util;
