//! # urun-runtime
//!
//! Execution modes and engines for containers run by unprivileged users.
//!
//! [`execmode::ExecutionMode`] persists the mode of a container and
//! prepares its tree on every change. [`engine::ExecutionEngine`]
//! implementations then turn a container id and [`options::RunOptions`]
//! into the final command: under `proot`, under a fakechroot shim, or
//! under `runc`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod base;
pub mod context;
pub mod engine;
pub mod execmode;
pub mod launch;
pub mod metadata;
pub mod options;
pub mod repo;
pub mod volumes;
