//! Strongly typed domain primitives for the workflow runtime.
//!
//! These newtypes keep run, stage, checkpoint and repository identifiers from
//! being mixed up as they flow between aggregates, stores and collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses an identifier from its string form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one workflow run.
    RunId
);
uuid_id!(
    /// Identifier of one materialized stage execution.
    WorkExecutionId
);
uuid_id!(
    /// Identifier of a frozen stage configuration slot.
    ///
    /// Preserved across `with_*` copies so edits can be matched back to the slot.
    WorkNodeId
);
uuid_id!(
    /// Identifier of a checkpoint.
    CheckpointId
);
uuid_id!(
    /// Identifier of a persisted task report.
    ReportId
);
uuid_id!(
    /// Identifier of a domain event (also the outbox message key).
    EventId
);
uuid_id!(
    /// Identifier of a dead-letter record.
    DeadLetterId
);

string_id!(
    /// Identifier of the workflow template a run was built from.
    WorkflowId
);
string_id!(
    /// External issue/ticket key a run works on.
    IssueKey
);
string_id!(
    /// Identifier of a repository reference inside a run's git pool.
    RepositoryId
);
string_id!(
    /// A git commit hash.
    CommitHash
);
string_id!(
    /// Identifier of an external agent session.
    SessionId
);

/// UTC timestamp wrapper for domain events and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampUtc(pub DateTime<Utc>);

impl TimestampUtc {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for TimestampUtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
