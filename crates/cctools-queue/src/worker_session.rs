//! The worker session state machine (§4.C): one TCP connection, carried by
//! its own Tokio task for the life of the session. The queue hub talks to it
//! through a pair of channels rather than driving the socket itself.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::cache::{Catalog, ContentId};
use crate::task::{CachePolicy, FileDirection, FileSource, Task, TaskResultKind, TaskTiming};
use crate::transport::{Transport, TransportError};

/// Arena index identifying a session within the queue's worker roster.
pub type SessionId = usize;

/// Announced worker capabilities, from the `ready` handshake line.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Hostname the worker announced.
    pub hostname: String,
    /// Worker build/version string.
    pub version: String,
    /// Available CPU cores.
    pub cores: u32,
    /// Available memory, MB.
    pub memory_mb: u64,
    /// Available disk, MB.
    pub disk_mb: u64,
}

/// Commands the queue hub sends to a session task.
pub enum WorkerSessionCommand {
    /// Run this task to completion on the worker.
    Dispatch(Task),
    /// Heartbeat: send `ping`, expect `pong` within `keepalive_timeout`.
    Ping,
    /// Ask the worker to disconnect; the session ends after this.
    Exit,
}

/// Events a session task reports back to the queue hub.
pub enum WorkerSessionEvent {
    /// Handshake completed; the worker is eligible for dispatch.
    Ready {
        session: SessionId,
        info: WorkerInfo,
    },
    /// A dispatched task reached a terminal state.
    Completed { session: SessionId, task: Task },
    /// The session died (transport failure, protocol error, or missed
    /// heartbeat). Carries the in-flight task, if one was outstanding.
    Dead {
        session: SessionId,
        reason: String,
        in_flight: Option<Task>,
    },
}

/// Default idle time before the hub pings a worker.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Default time to wait for a `pong` before declaring the session dead.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

struct Dispatched {
    task: Task,
    catalog: Catalog,
}

/// Run one worker session to completion: handshake, then serve commands
/// from `cmd_rx` until the worker disconnects, is told to exit, or its
/// transport fails.
pub async fn run_worker_session(
    stream: tokio::net::TcpStream,
    session: SessionId,
    mut cmd_rx: mpsc::Receiver<WorkerSessionCommand>,
    event_tx: mpsc::UnboundedSender<WorkerSessionEvent>,
    handshake_timeout: Duration,
) {
    let mut transport = Transport::from_stream(stream);

    let info = match handshake(&mut transport, handshake_timeout).await {
        Ok(info) => info,
        Err(err) => {
            let _ = event_tx.send(WorkerSessionEvent::Dead {
                session,
                reason: format!("handshake failed: {err}"),
                in_flight: None,
            });
            return;
        }
    };
    let _ = event_tx.send(WorkerSessionEvent::Ready {
        session,
        info,
    });

    let mut state = Dispatched {
        task: Task::new(""),
        catalog: Catalog::default(),
    };
    // `task` above is a placeholder overwritten on first real dispatch; we
    // never read it before a Dispatch command arrives.
    let _ = &state.task;

    loop {
        match cmd_rx.recv().await {
            None => break,
            Some(WorkerSessionCommand::Exit) => {
                let stoptime = Instant::now() + Duration::from_secs(5);
                let _ = transport.send_line("exit", stoptime).await;
                transport.close().await;
                break;
            }
            Some(WorkerSessionCommand::Ping) => {
                let stoptime = Instant::now() + DEFAULT_KEEPALIVE_TIMEOUT;
                if let Err(err) = ping(&mut transport, stoptime).await {
                    let _ = event_tx.send(WorkerSessionEvent::Dead {
                        session,
                        reason: format!("missed heartbeat: {err}"),
                        in_flight: None,
                    });
                    break;
                }
            }
            Some(WorkerSessionCommand::Dispatch(task)) => {
                match dispatch_task(&mut transport, task, &mut state.catalog).await {
                    Ok(task) => {
                        let _ = event_tx.send(WorkerSessionEvent::Completed { session, task });
                    }
                    Err((err, task)) => {
                        let _ = event_tx.send(WorkerSessionEvent::Dead {
                            session,
                            reason: err.to_string(),
                            in_flight: task,
                        });
                        break;
                    }
                }
            }
        }
    }
}

async fn handshake(
    transport: &mut Transport,
    timeout: Duration,
) -> Result<WorkerInfo, TransportError> {
    let stoptime = Instant::now() + timeout;
    let line = transport.recv_line(stoptime).await?;
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("");
    if verb != "ready" {
        return Err(TransportError::Failed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected ready banner, got {verb:?}"),
        )));
    }
    let hostname = parts.next().unwrap_or("unknown").to_string();
    let version = parts.next().unwrap_or("0").to_string();
    let cores = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let memory_mb = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let disk_mb = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(WorkerInfo {
        hostname,
        version,
        cores,
        memory_mb,
        disk_mb,
    })
}

async fn ping(transport: &mut Transport, stoptime: Instant) -> Result<(), TransportError> {
    transport.send_line("ping", stoptime).await?;
    let reply = transport.recv_line(stoptime).await?;
    if reply.trim() != "pong" {
        return Err(TransportError::Failed(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected pong, got {reply:?}"),
        )));
    }
    Ok(())
}

/// Run the atomic dispatch procedure of §4.C: stage inputs in order, send
/// the command, await the result, collect named outputs.
async fn dispatch_task(
    transport: &mut Transport,
    mut task: Task,
    catalog: &mut Catalog,
) -> Result<Task, (TransportError, Option<Task>)> {
    let submit_micros = micros_now();
    let op_timeout = Duration::from_secs(120);
    let mut total_transfer = Duration::ZERO;

    for spec in task.files().to_vec() {
        if spec.direction != FileDirection::In {
            continue;
        }
        let bytes = match &spec.local_source {
            FileSource::Path(path) => match std::fs::read(path) {
                Ok(b) => b,
                Err(_) => {
                    task.complete(
                        TaskResultKind::InputMissing,
                        None,
                        Vec::new(),
                        TaskTiming {
                            submit_micros,
                            start_micros: micros_now(),
                            finish_micros: micros_now(),
                            total_transfer,
                        },
                    );
                    return Ok(task);
                }
            },
            FileSource::Buffer(b) => b.clone(),
        };

        let cache = matches!(spec.cache_policy, CachePolicy::Cache);
        let content_id = ContentId::of_bytes(&bytes);
        if cache {
            if let Some(existing) = catalog.get(&spec.remote_name) {
                if existing == content_id {
                    continue;
                }
            }
        }

        let started = Instant::now();
        let header = format!(
            "put {} {} {}",
            spec.remote_name,
            bytes.len(),
            if cache { 1 } else { 0 }
        );
        let stoptime = Instant::now() + op_timeout;
        transport
            .send_line(&header, stoptime)
            .await
            .map_err(|e| (e, Some(task.clone())))?;
        transport
            .send_bytes(&bytes, stoptime)
            .await
            .map_err(|e| (e, Some(task.clone())))?;
        total_transfer += started.elapsed();

        if cache {
            catalog.insert(spec.remote_name.clone(), content_id);
        }
    }

    let start_micros = micros_now();
    let outputs: Vec<&str> = task
        .files()
        .iter()
        .filter(|f| f.direction == FileDirection::Out)
        .map(|f| f.remote_name.as_str())
        .collect();

    let header = format!(
        "work {} {}",
        task.command_line().len(),
        outputs.len()
    );
    let stoptime = Instant::now() + op_timeout;
    transport
        .send_line(&header, stoptime)
        .await
        .map_err(|e| (e, Some(task.clone())))?;
    transport
        .send_bytes(task.command_line().as_bytes(), stoptime)
        .await
        .map_err(|e| (e, Some(task.clone())))?;
    for name in &outputs {
        transport
            .send_line(name, stoptime)
            .await
            .map_err(|e| (e, Some(task.clone())))?;
    }

    let exec_timeout = Duration::from_secs(3600);
    let result_stoptime = Instant::now() + exec_timeout;
    let result_line = transport
        .recv_line(result_stoptime)
        .await
        .map_err(|e| (e, Some(task.clone())))?;
    let mut parts = result_line.split_whitespace();
    if parts.next() != Some("result") {
        return Err((
            TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected result line, got {result_line:?}"),
            )),
            Some(task),
        ));
    }
    let status: i32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1);
    let output_len: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let output = transport
        .recv_bytes(output_len, stoptime)
        .await
        .map_err(|e| (e, Some(task.clone())))?;

    let mut output_missing = false;
    for name in &outputs {
        let line = transport
            .recv_line(stoptime)
            .await
            .map_err(|e| (e, Some(task.clone())))?;
        let mut p = line.split_whitespace();
        match p.next() {
            Some("get") => {
                let _name = p.next().unwrap_or("");
                let len: usize = p.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let bytes = transport
                    .recv_bytes(len, stoptime)
                    .await
                    .map_err(|e| (e, Some(task.clone())))?;
                if let Some(spec) = task
                    .files()
                    .iter()
                    .find(|f| f.direction == FileDirection::Out && f.remote_name == *name)
                {
                    if let FileSource::Path(path) = &spec.local_source {
                        if let Err(err) = std::fs::write(path, &bytes) {
                            return Err((TransportError::Failed(err), Some(task)));
                        }
                    }
                }
            }
            Some("missing") => {
                output_missing = true;
            }
            _ => {
                return Err((
                    TransportError::Failed(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("expected get/missing line, got {line:?}"),
                    )),
                    Some(task),
                ));
            }
        }
    }

    let result_kind = if output_missing {
        TaskResultKind::OutputMissing
    } else if status != 0 {
        TaskResultKind::ExecFailed
    } else {
        TaskResultKind::Success
    };

    task.complete(
        result_kind,
        Some(status),
        output,
        TaskTiming {
            submit_micros,
            start_micros,
            finish_micros: micros_now(),
            total_transfer,
        },
    );
    Ok(task)
}

fn micros_now() -> u64 {
    chrono::Utc::now()
        .timestamp_micros()
        .try_into()
        .unwrap_or(0)
}
