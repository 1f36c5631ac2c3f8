#![doc = include_str!("../README.md")]

//! Activity precedence graphs for layered queueing network tasks.
//!
//! Descriptions are translated into an index-addressed [`Model`], quorum
//! joins are expanded, forks are matched with their joins, and the graph
//! of each entry is folded into per-phase service times, waiting times,
//! and variances.

pub mod actlist;
pub mod aggregate;
pub mod builder;
pub mod error;
pub mod expand;
pub mod link;
pub mod model;
pub mod pragma;
#[cfg(any(test, feature = "proptest"))]
pub mod proptest_generators;
pub mod quorum;

#[cfg(test)]
mod property_unit_tests;

pub use actlist::{ActivityList, AndFork, AndJoin, JoinType, ListKind, ListShape, OrFork, OrJoin, Repeat, EPSILON};
pub use aggregate::{ActivityVisit, CallVisit, InterlockPath, Payload};
pub use builder::{
    ActivityDescription, CallDescription, EntryDescription, GraphBuilder, ListDescription, ListMember,
    ModelDescription, TaskDescription,
};
pub use error::{ActivityPath, GraphError};
pub use model::{
    Activity, ActivityId, Call, CallKind, CalledBy, Entry, EntryId, EntryKind, ListId, Model, PhaseResults,
    PhaseType, ProcessorCall, Task, TaskId,
};
pub use pragma::{
    parse_quorum_delayed_calls, parse_quorum_distribution, PragmaError, Pragmas, QuorumDelayedCalls,
    QuorumDistribution,
};
pub use quorum::{LevelMeans, QuorumCdfs};
