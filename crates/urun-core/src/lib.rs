//! # urun-core
//!
//! Filesystem-level machinery that lets a container tree owned by an
//! unprivileged user run without a real chroot.
//!
//! - **Walker**: run an external command on every matching file of a tree
//!   with an early-exit policy.
//! - **Patcher**: rebase ELF interpreters and blind the container loader.
//! - **Links / file binds**: convert absolute symlinks and stage single
//!   host files for bind emulation.
//! - **Host probes**, passwd/group handling, the per-container lock and a
//!   bounded subprocess helper.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filebind;
pub mod host;
pub mod links;
pub mod loader;
pub mod lock;
pub mod nixauth;
pub mod patcher;
pub mod process;
pub mod walker;
