use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Difficulty, JobId, JobRecord, JobStatus, MysteryOutline, RequestId},
    error::ApiError,
};

/// Opaque server-owned state payload. Replaced wholesale on every
/// `state-changed` event; the client never merges it field by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(pub serde_json::Map<String, Value>);

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobQueueData {
    #[serde(default)]
    pub running: Vec<JobRecord>,
    #[serde(default)]
    pub completed: Vec<JobRecord>,
}

/// Incremental delta for one job. Absent fields leave the existing record's
/// values in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MysteryOutline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "state-changed")]
    StateChanged {
        state: Snapshot,
    },
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        response: Value,
    },
    InitialJobs {
        #[serde(default)]
        running: Vec<JobRecord>,
        #[serde(default)]
        completed: Vec<JobRecord>,
    },
    JobUpdate(JobUpdate),
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    GenerateMystery {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        theme: Option<String>,
        difficulty: Difficulty,
    },
    CancelJob {
        job_id: JobId,
    },
    GetJobs {},
    RefreshJobs {},
    GetJobStatus {
        job_id: JobId,
    },
}

impl ClientRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::GenerateMystery { .. } => "generate_mystery",
            Self::CancelJob { .. } => "cancel_job",
            Self::GetJobs {} => "get_jobs",
            Self::RefreshJobs {} => "refresh_jobs",
            Self::GetJobStatus { .. } => "get_job_status",
        }
    }
}

/// Outbound wire frame: the request plus the correlation id a `reply` echoes
/// back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientEnvelope {
    pub fn new(request: ClientRequest) -> Self {
        Self {
            request_id: RequestId::generate(),
            request,
        }
    }
}
