//! In-container participant wrapper.
//!
//! Every container in a workload starts here: register with the runner,
//! hold until the oracle clears this participant, then run the payload with
//! both output pipes captured. While the payload runs the wrapper keeps
//! polling the oracle; an `Interrupt` verdict (or the runner shutting down)
//! kills the payload. The payload's wait status is reported exactly once.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::agent::workload::ACCESS_TOKEN_ENV;
use crate::runner::client::{Client, POLL_INTERVAL};
use crate::runner::protocol::{RunState, WaitStatus};

const PIPE_CHUNK_SIZE: usize = 8 * 1024;

/// Inputs for one participant run.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Participant ID assigned at workload construction.
    pub id: u32,
    /// Coordination socket path.
    pub socket_path: PathBuf,
    /// Payload command line.
    pub command: Vec<String>,
}

/// Run the payload as a coordinated participant; returns its wait status.
pub async fn run(conf: ExecConfig) -> Result<WaitStatus> {
    let mut client = Client::new(conf.id, conf.socket_path.clone());
    let access_token = client
        .connect()
        .await
        .with_context(|| format!("registering participant {}", conf.id))?;
    debug!(id = conf.id, "registered, awaiting clearance");

    // Wait until cleared. A fast command can finish before a sidecar ever
    // sees Go; an Interrupt verdict at this point means there is nothing
    // left to run.
    loop {
        match client.status().await {
            Ok(RunState::Go) => break,
            Ok(RunState::Interrupt) => {
                info!(id = conf.id, "interrupted before start, nothing to run");
                return report_exit(&mut client, WaitStatus::from_code(0)).await;
            }
            Ok(RunState::Wait) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(err) if err.is_shutdown() => {
                info!(id = conf.id, "runner shut down before start, nothing to run");
                client.close().await;
                return Ok(WaitStatus::from_code(0));
            }
            Err(err) => return Err(err).context("awaiting clearance to run"),
        }
    }

    let (program, args) = conf
        .command
        .split_first()
        .context("empty payload command")?;
    let mut child = Command::new(program)
        .args(args)
        .env(ACCESS_TOKEN_ENV, &access_token)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning payload {program}"))?;
    info!(id = conf.id, payload = %program, "payload started");

    // Both pipes funnel through one channel so log bytes reach the runner
    // in a single ordered stream per connection.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let out_task = tokio::spawn(pump(child.stdout.take(), tx.clone()));
    let err_task = tokio::spawn(pump(child.stderr.take(), tx));

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let mut pipes_open = true;
    let mut interrupted = false;
    let status = loop {
        tokio::select! {
            chunk = rx.recv(), if pipes_open => match chunk {
                Some(chunk) => forward_chunk(&mut client, &chunk).await?,
                None => pipes_open = false,
            },
            exited = child.wait() => {
                break exited.context("waiting for payload")?;
            }
            _ = poll.tick() => {
                match client.status().await {
                    Ok(RunState::Interrupt) => {
                        if !interrupted {
                            interrupted = true;
                            info!(id = conf.id, "interrupt received, stopping payload");
                            let _ = child.start_kill();
                        }
                    }
                    Ok(_) => {}
                    Err(err) if err.is_shutdown() => {
                        if !interrupted {
                            interrupted = true;
                            info!(id = conf.id, "runner shut down, stopping payload");
                            let _ = child.start_kill();
                        }
                    }
                    Err(err) => return Err(err).context("polling run state"),
                }
            }
        }
    };

    // Drain buffered output that raced the exit.
    while let Some(chunk) = rx.recv().await {
        forward_chunk(&mut client, &chunk).await?;
    }
    let _ = out_task.await;
    let _ = err_task.await;

    let wait_status = WaitStatus::from(status);
    info!(id = conf.id, status = %wait_status, "payload finished");
    report_exit(&mut client, wait_status).await
}

/// Report the final wait status and release the connection.
///
/// The runner may already be gone when teardown was forced; that is not
/// this participant's failure.
async fn report_exit(client: &mut Client, status: WaitStatus) -> Result<WaitStatus> {
    match client.exit(status).await {
        Ok(()) => {}
        Err(err) if err.is_shutdown() => {}
        Err(err) => return Err(err).context("reporting exit status"),
    }
    client.close().await;
    Ok(status)
}

/// Forward one output chunk, tolerating a runner that already shut down.
async fn forward_chunk(client: &mut Client, chunk: &[u8]) -> Result<()> {
    match client.write(chunk).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_shutdown() => Ok(()),
        Err(err) => Err(err).context("forwarding logs"),
    }
}

/// Read a payload pipe to EOF, forwarding chunks to the log channel.
async fn pump<R: AsyncRead + Unpin>(pipe: Option<R>, tx: mpsc::Sender<Vec<u8>>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut buf = vec![0u8; PIPE_CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
