//! evees-core library.
//!
//! Immutable, content-addressed entities (commits and arbitrary data)
//! referenced through mutable, named pointers (perspectives), kept in sync
//! across untrusted backends through layered caches and reconciled with a
//! three-way merge.
//!
//! # Layers
//!
//! - [`hash`]: canonicalization and content identifiers.
//! - [`cas`]: the content-addressable store contract, its two-partition cache,
//!   the cache-over-base layering and the multi-source read router.
//! - [`model`]: perspectives, commits, updates and mutations.
//! - [`client`]: the pointer-state counterpart of [`cas`] (cache, layered
//!   client, per-remote mutation router).
//! - [`merge`]: common-ancestor search and the recursive three-way merge.
//! - [`condense`]: squashing runs of commits into one equivalent update.
//! - [`remote`]: backends (in-memory and SQLite).
//! - [`evees`]: the service facade tying the layers together.
//!
//! # Conventions
//!
//! - **Errors**: library functions return [`error::Result`]; the CLI wraps them
//!   in `anyhow`.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod cas;
pub mod client;
pub mod condense;
pub mod config;
pub mod error;
pub mod evees;
pub mod hash;
pub mod merge;
pub mod model;
pub mod proposals;
pub mod remote;

pub use error::{ErrorCode, EveesError, Result};
pub use evees::{Evees, EveesContext};
pub use hash::Hasher;
pub use model::{
    Commit, Entity, EveesMutation, NewPerspective, Perspective, PerspectiveDetails, Update,
};
