//! Three-way merge of perspectives.
//!
//! # Sub-modules
//!
//! - [`ancestor`]: ancestry queries over the commit DAG ([`CommitGraph`]).
//! - [`arrays`]: the three-way rules for scalars and ordered link lists.
//! - [`behaviour`]: per-type dispatch of which fields hold links.
//! - [`strategy`]: the recursive perspective merge ([`MergeStrategy`]).
//!
//! The merge is total. Divergent edits never fail; they resolve to the side
//! configured in [`MergeConfig::winner`].

pub mod ancestor;
pub mod arrays;
pub mod behaviour;
pub mod strategy;

pub use ancestor::CommitGraph;
pub use arrays::{Side, merge_ordered, merge_scalar};
pub use behaviour::{BehaviourRegistry, MergeBehaviour, PlainData, TextNode};
pub use strategy::{MergeConfig, MergeOutcome, MergeStrategy};
