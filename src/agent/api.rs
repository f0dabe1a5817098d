//! Remote build service interface.
//!
//! The controller consumes exactly these capabilities: lease a job, start
//! it, stream log chunks, submit the final status. The concrete HTTP client
//! lives outside this crate; the runner itself never makes outbound calls.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runner::protocol::WaitStatus;

/// A leased build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job ID assigned by the build service.
    pub id: String,
    /// Environment the job was scheduled with; the workload builder reads
    /// the reserved `BUILDKITE_*` keys from here.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One chunk of captured job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    /// Chunk payload.
    pub data: String,
    /// Monotonic chunk counter, starting at 0.
    pub sequence: u64,
    /// Byte offset of this chunk within the whole log stream.
    pub offset: u64,
}

/// Client surface of the remote build service.
#[async_trait]
pub trait BuildApi: Send + Sync {
    /// Lease the next available job, if any.
    async fn lease_job(&self) -> Result<Option<Job>>;

    /// Mark a leased job as started.
    async fn start_job(&self, job: &Job) -> Result<()>;

    /// Upload one chunk of job output.
    async fn upload_log_chunk(&self, job_id: &str, chunk: LogChunk) -> Result<()>;

    /// Submit the job's final status.
    async fn finish_job(&self, job: &Job, status: WaitStatus) -> Result<()>;
}
