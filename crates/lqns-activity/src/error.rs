//! Graph construction and traversal errors.

use std::fmt;

use lqns_prob::QuorumError;
use miette::Diagnostic;
use thiserror::Error;

use crate::actlist::ListShape;

/// Chain of activity names carried by a traversal failure, in traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityPath(pub Vec<String>);

impl ActivityPath {
    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ActivityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

#[derive(Debug, Clone, Error, Diagnostic, PartialEq)]
pub enum GraphError {
    #[error("Cycle in activity graph: {path}")]
    #[diagnostic(
        code(lqns::graph::cycle),
        help("an activity may not precede itself; break the loop with a repeat list")
    )]
    ActivityCycle { path: ActivityPath, depth: usize },

    #[error("Join path mismatch; backtrace is \"{path}\"")]
    #[diagnostic(code(lqns::graph::bad_internal_join))]
    BadInternalJoin { path: ActivityPath, depth: usize },

    #[error("External synchronization not supported; backtrace is \"{path}\"")]
    #[diagnostic(
        code(lqns::graph::bad_external_join),
        help("every branch of an AND-join must originate from the matching AND-fork")
    )]
    BadExternalJoin { path: ActivityPath, depth: usize },

    #[error("Join \"{join}\" does not match a single fork")]
    #[diagnostic(code(lqns::graph::join_path_mismatch))]
    JoinPathMismatch { join: String },

    #[error("Activity \"{activity}\" appears in more than one fork list")]
    #[diagnostic(code(lqns::input::duplicate_rvalue))]
    DuplicateFork { activity: String },

    #[error("Activity \"{activity}\" appears in more than one join list")]
    #[diagnostic(code(lqns::input::duplicate_lvalue))]
    DuplicateJoin { activity: String },

    #[error("Activity \"{activity}\" is a start activity and cannot be the target of a fork")]
    #[diagnostic(code(lqns::input::is_start_activity))]
    IsStartActivity { activity: String },

    #[error("Branch probabilities of OR-fork \"{list}\" sum to {sum}")]
    #[diagnostic(
        code(lqns::input::missing_or_branch),
        help("OR-fork branch probabilities must sum to 1")
    )]
    MissingOrBranch { list: String, sum: f64 },

    #[error("Activity \"{activity}\" replies from inside a quorum join")]
    #[diagnostic(
        code(lqns::input::quorum_reply),
        help("move the reply after the quorum join")
    )]
    QuorumReply { activity: String },

    #[error("Entry \"{entry}\" generates {replies} replies")]
    #[diagnostic(code(lqns::input::non_unity_replies))]
    NonUnityReplies { entry: String, replies: f64 },

    #[error("Activity \"{activity}\" replies to send-no-reply entry \"{entry}\"")]
    #[diagnostic(code(lqns::input::reply_for_snr_entry))]
    ReplyForSendNoReply { activity: String, entry: String },

    #[error("Activity \"{activity}\" has an invalid reply to entry \"{entry}\"")]
    #[diagnostic(code(lqns::input::invalid_reply))]
    InvalidReply { activity: String, entry: String },

    #[error("Activity \"{activity}\" replies to entry \"{entry}\" in phase 2")]
    #[diagnostic(code(lqns::input::duplicate_reply))]
    DuplicateReply { activity: String, entry: String },

    #[error("Activity \"{activity}\" has no service time")]
    #[diagnostic(code(lqns::input::activity_not_specified))]
    ActivityNotSpecified { activity: String },

    #[error("Activity \"{activity}\" is not reachable from any entry")]
    #[diagnostic(code(lqns::input::activity_not_reachable))]
    ActivityNotReachable { activity: String },

    #[error("{kind} \"{name}\" is not defined")]
    #[diagnostic(code(lqns::input::not_defined))]
    NotDefined { kind: &'static str, name: String },

    #[error("Expected a {expected} list, found a {found} list")]
    #[diagnostic(code(lqns::internal::wrong_list_kind))]
    WrongListKind { expected: ListShape, found: ListShape },

    #[error("Quorum join \"{join}\" is not followed by a single activity")]
    #[diagnostic(
        code(lqns::quorum::unsupported_continuation),
        help("the quorum graph can only be expanded when the join leads to one activity")
    )]
    UnsupportedQuorumContinuation { join: String },

    #[error("Quorum delay activity \"{name}\" not found")]
    #[diagnostic(code(lqns::quorum::missing_delay_activity))]
    MissingQuorumDelayActivity { name: String },

    #[error("Not implemented: {0}")]
    #[diagnostic(code(lqns::not_implemented))]
    NotImplemented(String),

    #[error("Submodel {0} is not valid here")]
    #[diagnostic(code(lqns::internal::invalid_submodel))]
    InvalidSubmodel(usize),

    #[error(transparent)]
    #[diagnostic(code(lqns::quorum::distribution))]
    Distribution(#[from] QuorumError),
}

impl GraphError {
    /// Traversal depth reached before the error, for path errors.
    pub fn depth(&self) -> Option<usize> {
        match self {
            GraphError::ActivityCycle { depth, .. }
            | GraphError::BadInternalJoin { depth, .. }
            | GraphError::BadExternalJoin { depth, .. } => Some(*depth),
            _ => None,
        }
    }
}
