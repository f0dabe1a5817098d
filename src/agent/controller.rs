//! Outer controller: one coordination runner per leased job.
//!
//! The controller owns the lifetime of a job: it marks the job started,
//! builds the workload spec, runs the coordination server with a pipe as
//! its log sink, streams captured bytes to the build service, submits the
//! workload, and reports the aggregated wait status once coordination
//! finishes. Cancellation of the supplied token is the ultimate teardown
//! authority and converges on the runner's `done` latch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::api::{BuildApi, Job, LogChunk};
use crate::agent::workload::{Orchestrator, WorkloadBuilder, WorkloadPhase};
use crate::config::AgentConfig;
use crate::runner::protocol::WaitStatus;
use crate::runner::{Runner, RunnerConfig};

/// Process exit code for a cancellation-driven shutdown.
pub const SHUTDOWN_EXIT_CODE: i32 = 130;

const LOG_PIPE_CAPACITY: usize = 64 * 1024;
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of driving one job to completion.
#[derive(Debug, Clone, Copy)]
pub struct JobOutcome {
    /// Aggregated wait status of the job.
    pub status: WaitStatus,
    /// Whether teardown was driven by cancellation rather than the normal
    /// all-exited path.
    pub cancelled: bool,
}

impl JobOutcome {
    /// Exit code for the outer agent process: 0 on success, the aggregate
    /// code on failure, [`SHUTDOWN_EXIT_CODE`] for a cancelled shutdown.
    pub fn exit_code(&self) -> i32 {
        if self.status.exit_code != 0 {
            self.status.exit_code
        } else if self.cancelled {
            SHUTDOWN_EXIT_CODE
        } else {
            0
        }
    }
}

/// Drives leased jobs through workload submission and coordination.
pub struct JobController {
    api: Arc<dyn BuildApi>,
    orchestrator: Arc<dyn Orchestrator>,
    conf: AgentConfig,
    access_token: String,
}

impl JobController {
    pub fn new(
        api: Arc<dyn BuildApi>,
        orchestrator: Arc<dyn Orchestrator>,
        conf: AgentConfig,
        access_token: String,
    ) -> Self {
        Self {
            api,
            orchestrator,
            conf,
            access_token,
        }
    }

    /// Lease and run jobs until cancelled.
    pub async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let ping_interval = Duration::from_secs(self.conf.ping_interval_secs.max(1));
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.api.lease_job().await {
                Ok(Some(job)) => match self.run_job(&job, &shutdown).await {
                    Ok(outcome) => {
                        info!(job = %job.id, code = outcome.status.exit_code, "job finished");
                    }
                    Err(e) => warn!(job = %job.id, "running job: {e:#}"),
                },
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(ping_interval) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
                Err(e) => {
                    warn!("leasing job: {e:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(ping_interval) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    /// Run a single leased job to completion.
    pub async fn run_job(&self, job: &Job, shutdown: &CancellationToken) -> Result<JobOutcome> {
        self.api.start_job(job).await.context("starting job")?;

        let builder = WorkloadBuilder {
            agent_image: self.conf.agent_image.clone(),
            checkout_path: self.conf.checkout_path.clone(),
            checkout_command: self.conf.checkout_command.clone(),
            access_token: self.access_token.clone(),
        };
        let spec = builder.build(job).context("building workload spec")?;

        let (sink, log_source) = tokio::io::duplex(LOG_PIPE_CAPACITY);
        let runner = Arc::new(Runner::new(
            RunnerConfig {
                socket_path: self.conf.socket_path.clone(),
                participant_count: spec.participant_count(),
                access_token: self.access_token.clone(),
            },
            Box::new(sink),
        ));

        let runner_task = tokio::spawn(Arc::clone(&runner).run(shutdown.child_token()));
        let mut uploader = tokio::spawn(upload_logs(
            Arc::clone(&self.api),
            job.id.clone(),
            log_source,
        ));

        let workload_name = self
            .orchestrator
            .create_workload(&spec)
            .await
            .context("creating workload")?;
        info!(workload = %workload_name, job = %job.id, "workload submitted");

        // A workload that reaches a terminal failure before coordination
        // finishes will never satisfy the all-exited barrier; force it.
        let watch = {
            let orchestrator = Arc::clone(&self.orchestrator);
            let runner = Arc::clone(&runner);
            let name = workload_name.clone();
            tokio::spawn(async move {
                match orchestrator.await_terminal(&name).await {
                    Ok(WorkloadPhase::Succeeded) => {}
                    Ok(WorkloadPhase::Failed) => {
                        warn!(workload = %name, "workload failed before coordination finished");
                        runner.terminate();
                    }
                    Err(e) => {
                        warn!(workload = %name, "watching workload: {e:#}");
                        runner.terminate();
                    }
                }
            })
        };

        runner.done().cancelled().await;
        let run_result = runner_task.await.context("joining runner task")?;

        watch.abort();
        let _ = watch.await;

        let cancelled = shutdown.is_cancelled();
        let status = runner.wait_status().await;

        // Dropping our handle closes the sink once the last connection
        // task finishes; connections may outlive `done`, so bound the
        // drain rather than waiting for a straggler.
        drop(runner);
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut uploader)
            .await
            .is_err()
        {
            uploader.abort();
        }

        if let Err(e) = run_result {
            // Runner-level failure is a job failure; make sure the build
            // service sees a non-zero status.
            warn!(job = %job.id, "coordination server failed: {e:#}");
            let status = WaitStatus::from_code(1);
            self.api
                .finish_job(job, status)
                .await
                .context("finishing job")?;
            return Ok(JobOutcome { status, cancelled });
        }

        self.api
            .finish_job(job, status)
            .await
            .context("finishing job")?;
        Ok(JobOutcome { status, cancelled })
    }
}

/// Forward captured log bytes to the build service in chunk order.
async fn upload_logs(api: Arc<dyn BuildApi>, job_id: String, mut source: DuplexStream) {
    let mut buf = vec![0u8; 16 * 1024];
    let mut sequence = 0u64;
    let mut offset = 0u64;
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = LogChunk {
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    sequence,
                    offset,
                };
                sequence += 1;
                offset += n as u64;
                if let Err(e) = api.upload_log_chunk(&job_id, chunk).await {
                    warn!(job = %job_id, "uploading log chunk: {e:#}");
                }
            }
            Err(e) => {
                warn!(job = %job_id, "reading log stream: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_success() {
        let outcome = JobOutcome {
            status: WaitStatus::from_code(0),
            cancelled: false,
        };
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn test_exit_code_mirrors_failure() {
        let outcome = JobOutcome {
            status: WaitStatus::from_code(42),
            cancelled: false,
        };
        assert_eq!(outcome.exit_code(), 42);
    }

    #[test]
    fn test_exit_code_distinct_for_cancellation() {
        let outcome = JobOutcome {
            status: WaitStatus::from_code(0),
            cancelled: true,
        };
        assert_eq!(outcome.exit_code(), SHUTDOWN_EXIT_CODE);

        // A concrete failure still wins over the shutdown marker.
        let failed = JobOutcome {
            status: WaitStatus::from_code(3),
            cancelled: true,
        };
        assert_eq!(failed.exit_code(), 3);
    }
}
