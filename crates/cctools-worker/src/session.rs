//! One connection's worth of the worker side of the protocol: handshake,
//! then serve `put`/`work`/`ping`/`exit` until the master hangs up or asks
//! us to leave.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use cctools_queue::transport::Transport;
use cctools_resource_monitor::monitor::{supervise, ResourceLimits};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const WORKER_VERSION: &str = "1";
const OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Fixed announcements and execution policy for this worker process.
pub struct WorkerConfig {
    pub hostname: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub workdir: PathBuf,
    pub task_timeout: Duration,
}

/// Connect to `host:port`, run the session to completion.
///
/// Returns `Ok(())` only when the master sent an explicit `exit`; any other
/// disconnection is an `Err` so the caller retries.
pub async fn run_session(host: &str, port: u16, config: &WorkerConfig) -> anyhow::Result<()> {
    let sandbox = config.workdir.join("sandbox");
    std::fs::create_dir_all(&sandbox)?;

    let mut transport = Transport::open(host, port, Instant::now() + Duration::from_secs(30)).await?;

    let ready = format!(
        "ready {} {} {} {} {}",
        config.hostname, WORKER_VERSION, config.cores, config.memory_mb, config.disk_mb
    );
    transport
        .send_line(&ready, Instant::now() + OP_TIMEOUT)
        .await?;

    // Files put with the cache flag set survive across tasks; everything
    // else is removed from the sandbox once its task finishes.
    let mut resident: HashSet<String> = HashSet::new();
    let mut pending_inputs: Vec<(String, bool)> = Vec::new();

    loop {
        let line = transport
            .recv_line(Instant::now() + Duration::from_secs(24 * 3600))
            .await?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("put") => {
                let name = parts.next().unwrap_or("").to_string();
                let len: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let cache = parts.next().and_then(|s| s.parse::<u8>().ok()).unwrap_or(0) != 0;
                let bytes = transport
                    .recv_bytes(len, Instant::now() + OP_TIMEOUT)
                    .await?;
                std::fs::write(sandbox.join(&name), &bytes)?;
                if cache {
                    resident.insert(name.clone());
                }
                pending_inputs.push((name, cache));
            }
            Some("work") => {
                let cmd_len: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let outputs_count: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let cmd_bytes = transport
                    .recv_bytes(cmd_len, Instant::now() + OP_TIMEOUT)
                    .await?;
                let command_line = String::from_utf8_lossy(&cmd_bytes).into_owned();

                let mut output_names = Vec::with_capacity(outputs_count);
                for _ in 0..outputs_count {
                    output_names.push(
                        transport
                            .recv_line(Instant::now() + OP_TIMEOUT)
                            .await?,
                    );
                }

                let (status, output) = run_command(&sandbox, &command_line, config.task_timeout)
                    .await
                    .unwrap_or_else(|err| (-1, format!("worker error: {err:#}").into_bytes()));

                transport
                    .send_line(
                        &format!("result {status} {}", output.len()),
                        Instant::now() + OP_TIMEOUT,
                    )
                    .await?;
                transport
                    .send_bytes(&output, Instant::now() + OP_TIMEOUT)
                    .await?;

                for name in &output_names {
                    let path = sandbox.join(name);
                    match std::fs::read(&path) {
                        Ok(bytes) => {
                            transport
                                .send_line(
                                    &format!("get {name} {}", bytes.len()),
                                    Instant::now() + OP_TIMEOUT,
                                )
                                .await?;
                            transport
                                .send_bytes(&bytes, Instant::now() + OP_TIMEOUT)
                                .await?;
                        }
                        Err(_) => {
                            transport
                                .send_line(&format!("missing {name}"), Instant::now() + OP_TIMEOUT)
                                .await?;
                        }
                    }
                }

                for (name, cache) in pending_inputs.drain(..) {
                    if !cache {
                        let _ = std::fs::remove_file(sandbox.join(&name));
                    }
                }
                for name in &output_names {
                    if !resident.contains(name) {
                        let _ = std::fs::remove_file(sandbox.join(name));
                    }
                }
            }
            Some("ping") => {
                transport
                    .send_line("pong", Instant::now() + OP_TIMEOUT)
                    .await?;
            }
            Some("exit") => {
                transport.close().await;
                return Ok(());
            }
            _ => {
                anyhow::bail!("unrecognized verb from master: {line:?}");
            }
        }
    }
}

async fn run_command(
    sandbox: &std::path::Path,
    command_line: &str,
    timeout: Duration,
) -> anyhow::Result<(i32, Vec<u8>)> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(sandbox)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    // Drained so the child never blocks writing to a full pipe, but not
    // merged into `output`: a task's captured output is stdout only.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let limits = ResourceLimits {
        max_wall_time: Some(timeout),
        max_memory_kb: None,
    };
    let summary = supervise(&mut child, limits, Duration::from_millis(500), sandbox).await?;

    let output = stdout_task.await.unwrap_or_default();
    let _ = stderr_task.await;

    let status = match summary.exit_status {
        Some(status) => status.code().unwrap_or(-1),
        None => -1, // killed for exceeding a resource limit
    };
    Ok((status, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_captures_output_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (status, output) = run_command(dir.path(), "echo hi", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(output, b"hi\n");
    }

    #[tokio::test]
    async fn run_command_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _) = run_command(dir.path(), "exit 7", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, 7);
    }

    #[tokio::test]
    async fn run_command_kills_on_wall_time_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _) = run_command(dir.path(), "sleep 5", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(status, -1);
    }
}
