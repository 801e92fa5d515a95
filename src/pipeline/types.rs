//! Core types for the job pipeline
//!
//! Wire shapes handed out by the queue and the small enums that describe
//! where a job is in its lifecycle.

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status string the queue uses for a job this runner still owns
pub const RUNNING_STATUS: &str = "RUNNING";

/// A job claimed from the queue.
///
/// Immutable for the duration of one orchestrator iteration and never
/// persisted by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Queue-assigned job id
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,

    /// Where the app should run
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub runtime_node: RuntimeNode,

    /// What to deploy
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub payload: JobPayload,

    /// Why the job body could not be decoded, when only its id could
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl Job {
    /// Decodes a claimed job.
    ///
    /// A body whose fields do not decode still yields a job as long as its
    /// id does: the job is leased to this runner and has to be reported.
    /// Such a job carries the decode error in [`Job::malformed`] and default
    /// values everywhere else.
    ///
    /// # Errors
    ///
    /// Returns the decode error when not even the id can be read.
    pub fn from_wire(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct IdOnly {
            #[serde(default, deserialize_with = "lenient::opt_string")]
            id: Option<String>,
        }

        match Self::deserialize(&value) {
            Ok(job) => Ok(job),
            Err(e) => {
                let IdOnly { id } = IdOnly::deserialize(&value)?;
                if id.is_none() {
                    return Err(e);
                }
                Ok(Self {
                    id,
                    malformed: Some(e.to_string()),
                    ..Self::default()
                })
            }
        }
    }
}

/// Target runtime node for a job
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeNode {
    /// Base URL of the runtime agent on that node
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub agent_base_url: Option<String>,
}

/// Deploy request carried by a job.
///
/// Every field is optional on the wire; blank strings are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct JobPayload {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub app_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub user_id: Option<String>,
    /// Prebuilt image; when present nothing is cloned or built
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub repo_ssh_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub git_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub image_tag: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_port")]
    pub container_port: Option<u16>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_path: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub acr_registry: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub acr_namespace: Option<String>,
}

/// Pipeline phase, as reported in phase heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Job claimed, nothing done yet
    Claimed,
    /// Fetching source
    Clone,
    /// Building the image
    Build,
    /// Pushing the image
    Push,
    /// Instructing the runtime agent
    Deploy,
    /// Terminal report sent
    Reported,
}

impl Phase {
    /// Wire name of the phase
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "CLAIMED",
            Self::Clone => "CLONE",
            Self::Build => "BUILD",
            Self::Push => "PUSH",
            Self::Deploy => "DEPLOY",
            Self::Reported => "REPORTED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status sent in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    /// Every phase completed
    Succeeded,
    /// Some phase failed
    Failed,
}

impl ReportStatus {
    /// Returns true for [`ReportStatus::Succeeded`]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Queue answer to a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Job status as seen by the queue, when it says
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub status: Option<String>,
}

impl HeartbeatAck {
    /// Ack carrying an explicit status
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
        }
    }

    /// False when the queue reports any status other than `RUNNING`.
    ///
    /// An absent status means the queue did not say otherwise.
    pub fn is_running(&self) -> bool {
        self.status
            .as_deref()
            .is_none_or(|s| s.eq_ignore_ascii_case(RUNNING_STATUS))
    }
}

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Job id
    pub job_id: String,
    /// Status the runner decided on
    pub status: ReportStatus,
    /// Whether the queue accepted the report
    pub reported: bool,
    /// Image that was (or would have been) deployed
    pub image: Option<String>,
    /// Failure description for failed jobs
    pub error: Option<String>,
}

impl JobOutcome {
    /// Returns true when every phase completed
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Deserializers tolerant of the queue emitting numbers where strings are
/// expected (and vice versa).
mod lenient {
    use serde::de::{DeserializeOwned, Error};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    impl Scalar {
        fn into_text(self) -> String {
            match self {
                Self::Text(s) => s.trim().to_string(),
                Self::Int(i) => i.to_string(),
                #[allow(clippy::cast_possible_truncation)]
                Self::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
                Self::Float(f) => f.to_string(),
                Self::Bool(b) => b.to_string(),
            }
        }
    }

    pub(super) fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<Scalar> = Option::deserialize(deserializer)?;
        Ok(value.map(Scalar::into_text).filter(|s| !s.is_empty()))
    }

    pub(super) fn opt_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match opt_string(deserializer)? {
            None => Ok(None),
            Some(text) => text
                .parse::<u16>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid port '{text}'"))),
        }
    }

    /// Treats an explicit `null` like a missing field
    pub(super) fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }
}
