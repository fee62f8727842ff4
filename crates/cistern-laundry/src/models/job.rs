//! Job model - one washing request and its lifecycle.

use serde::{Deserialize, Serialize};

use super::Demand;

/// Job identifier, assigned in submission order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Pending -> InProgress -> Completed | Failed`; a job whose assignment fails
/// goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A job record as kept in the queue's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// Resources the job consumes
    pub demand: Demand,

    /// Recorded with the job; dispatch order is FIFO regardless
    pub priority: i32,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Submission time (ms since Unix epoch)
    pub created_at: u64,

    /// When a unit took the job
    pub started_at: Option<u64>,

    /// When the job reached a terminal state
    pub ended_at: Option<u64>,

    /// Assignment attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Unit the job was assigned to
    pub unit: Option<String>,

    /// Peer the job was handed to after a shortfall
    pub delegated_to: Option<String>,

    /// Failure reason for failed jobs
    pub error: Option<String>,
}

impl Job {
    /// Create a pending job.
    pub fn new(id: JobId, demand: Demand, priority: i32) -> Self {
        Self {
            id,
            demand,
            priority,
            status: JobStatus::Pending,
            created_at: now_millis(),
            started_at: None,
            ended_at: None,
            attempts: 0,
            unit: None,
            delegated_to: None,
            error: None,
        }
    }
}

/// Status change published by the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cistern_transfer::ResourceKind;

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(JobId(7), Demand::new().with(ResourceKind::Water, 20), 1);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert_eq!(job.id.to_string(), "job-7");
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn serialize_deserialize() {
        let job = Job::new(JobId(1), Demand::new().with(ResourceKind::Energy, 30), 0);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        let parsed: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(job, parsed);
    }
}
