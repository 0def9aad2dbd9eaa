//! The dispatch engine (§4.E): the hub every driver talks to. Single
//! logical event loop — admits workers, matches them to waiting tasks,
//! applies fast-abort and retry policy, and hands completed tasks back to
//! the driver through `wait`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::task::{Task, TaskId, TaskResultKind, MAX_COMMAND_LINE_BYTES};
use crate::worker_session::{
    run_worker_session, SessionId, WorkerInfo, WorkerSessionCommand, WorkerSessionEvent,
};

/// Errors returned directly to the driver by the public API.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `command_line` exceeded [`MAX_COMMAND_LINE_BYTES`]; nothing was sent.
    #[error("invalid_argument: command line exceeds {MAX_COMMAND_LINE_BYTES} bytes")]
    InvalidArgument,
    /// The queue has been asked to shut down; no further tasks are accepted.
    #[error("queue is shutting down")]
    ShuttingDown,
    /// The queue's event loop is gone.
    #[error("queue event loop is not running")]
    EventLoopGone,
}

/// Tunable policy knobs for a [`Queue`].
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Fast-abort multiplier `k`; `None` disables fast-abort (`k = ∞`).
    pub fast_abort_multiplier: Option<f64>,
    /// Maximum retry attempts before a task is delivered with final failure.
    pub retry_max: u32,
    /// `hungry()` is true while `waiting < hungry_factor * ready_workers`.
    pub hungry_factor: f64,
    /// How long a worker may idle before the hub sends a heartbeat ping.
    pub keepalive_interval: Duration,
    /// How long the hub waits for a `pong` before declaring a worker dead.
    pub keepalive_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fast_abort_multiplier: Some(10.0),
            retry_max: 3,
            hungry_factor: 1.0,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

/// Aggregate counters exposed by `stats()`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    /// Tasks waiting to be dispatched.
    pub waiting: usize,
    /// Tasks currently running on a worker.
    pub running: usize,
    /// Tasks completed but not yet delivered to the driver.
    pub complete: usize,
    /// Workers mid-handshake.
    pub workers_init: usize,
    /// Workers eligible for dispatch.
    pub workers_ready: usize,
    /// Workers with a task outstanding.
    pub workers_busy: usize,
    /// Cumulative bytes transferred (inputs + outputs) across all tasks.
    pub bytes_transferred: u64,
    /// Cumulative wall-clock runtime of completed tasks, microseconds.
    pub total_runtime_micros: u64,
}

enum WorkerState {
    Init,
    Ready,
    Busy,
}

struct WorkerSlot {
    info: Option<WorkerInfo>,
    state: WorkerState,
    cmd_tx: mpsc::Sender<WorkerSessionCommand>,
    join: JoinHandle<()>,
    failures: u32,
    last_active: Instant,
}

struct RunningEntry {
    task: Task,
    started: Instant,
}

enum QueueCommand {
    Submit(Task, oneshot::Sender<Result<TaskId, QueueError>>),
    Wait {
        timeout: Duration,
        reply: oneshot::Sender<Option<Task>>,
    },
    Hungry(oneshot::Sender<bool>),
    Empty(oneshot::Sender<bool>),
    ShutdownWorkers {
        n: usize,
        reply: oneshot::Sender<usize>,
    },
    Stats(oneshot::Sender<QueueStats>),
    Terminate,
}

/// Handle to a running queue event loop.
pub struct Queue {
    cmd_tx: mpsc::Sender<QueueCommand>,
    join: JoinHandle<anyhow::Result<()>>,
    addr: std::net::SocketAddr,
}

impl Queue {
    /// Bind a listening TCP port and start accepting worker connections.
    pub async fn create(port: u16, config: QueueConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let join = tokio::spawn(run_core(listener, config, cmd_rx));
        Ok(Self { cmd_tx, join, addr })
    }

    /// The address workers should connect to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// The port actually bound (useful when `port = 0` requested an
    /// ephemeral port); only meaningful before the queue is dropped.
    pub async fn submit(&self, task: Task) -> Result<TaskId, QueueError> {
        if task.command_line().len() > MAX_COMMAND_LINE_BYTES {
            return Err(QueueError::InvalidArgument);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(QueueCommand::Submit(task, tx))
            .await
            .map_err(|_| QueueError::EventLoopGone)?;
        rx.await.map_err(|_| QueueError::EventLoopGone)?
    }

    /// Wait up to `timeout` for a completed task; `Duration::ZERO` polls.
    pub async fn wait(&self, timeout: Duration) -> Option<Task> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(QueueCommand::Wait { timeout, reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// True when the waiting depth is below the hungry threshold.
    pub async fn hungry(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(QueueCommand::Hungry(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// True when there is nothing waiting or running.
    pub async fn empty(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(QueueCommand::Empty(tx)).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Ask up to `n` ready workers to exit (`0` = all); returns the number
    /// actually dismissed.
    pub async fn shutdown_workers(&self, n: usize) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(QueueCommand::ShutdownWorkers { n, reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Snapshot of the aggregate counters.
    pub async fn stats(&self) -> QueueStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(QueueCommand::Stats(tx)).await.is_err() {
            return QueueStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// `stats()` rendered as a JSON line, for the progress logs drivers print.
    pub async fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats().await).unwrap_or_else(|_| "{}".to_string())
    }

    /// Translate a termination signal: stop accepting new submissions, let
    /// `wait` return `None` from now on, and begin draining.
    pub async fn terminate(&self) {
        let _ = self.cmd_tx.send(QueueCommand::Terminate).await;
    }

    /// Wait for the event loop to finish (after `terminate` and all workers
    /// have been dismissed).
    pub async fn join(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("queue event loop join error: {err}")),
        }
    }
}

struct Core {
    workers: Vec<Option<WorkerSlot>>,
    event_tx: mpsc::UnboundedSender<WorkerSessionEvent>,
    waiting: VecDeque<Task>,
    running: HashMap<SessionId, RunningEntry>,
    completed: VecDeque<Task>,
    waiters: VecDeque<(Instant, oneshot::Sender<Option<Task>>)>,
    next_task_id: TaskId,
    avg_count: u64,
    avg_mean_micros: f64,
    stats: QueueStats,
    config: QueueConfig,
    shutting_down: bool,
}

impl Core {
    fn hungry(&self) -> bool {
        let ready = self
            .workers
            .iter()
            .flatten()
            .filter(|w| matches!(w.state, WorkerState::Ready))
            .count();
        (self.waiting.len() as f64) < self.config.hungry_factor * (ready.max(1) as f64)
    }

    fn empty(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    fn refresh_stats(&mut self) {
        self.stats.waiting = self.waiting.len();
        self.stats.running = self.running.len();
        self.stats.complete = self.completed.len();
        self.stats.workers_init = 0;
        self.stats.workers_ready = 0;
        self.stats.workers_busy = 0;
        for slot in self.workers.iter().flatten() {
            match slot.state {
                WorkerState::Init => self.stats.workers_init += 1,
                WorkerState::Ready => self.stats.workers_ready += 1,
                WorkerState::Busy => self.stats.workers_busy += 1,
            }
        }
    }

    fn record_success_duration(&mut self, micros: u64) {
        self.avg_count += 1;
        let n = self.avg_count as f64;
        self.avg_mean_micros += (micros as f64 - self.avg_mean_micros) / n;
        self.stats.total_runtime_micros = self.stats.total_runtime_micros.saturating_add(micros);
    }

    fn dispatch_ready_workers(&mut self) {
        let ready_idxs: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(w) if matches!(w.state, WorkerState::Ready) => Some(i),
                _ => None,
            })
            .collect();

        for idx in ready_idxs {
            if self.waiting.is_empty() {
                break;
            }
            let Some(task) = self.waiting.pop_front() else {
                break;
            };
            let mut task = task;
            task.increment_attempts();

            let Some(slot) = self.workers[idx].as_mut() else {
                continue;
            };
            let started = Instant::now();
            self.running.insert(
                idx,
                RunningEntry {
                    task: task.clone(),
                    started,
                },
            );
            if slot
                .cmd_tx
                .try_send(WorkerSessionCommand::Dispatch(task))
                .is_ok()
            {
                slot.state = WorkerState::Busy;
                slot.last_active = started;
            } else {
                // Command channel full or closed: treat as immediately dead.
                self.workers[idx] = None;
                if let Some(entry) = self.running.remove(&idx) {
                    self.requeue_or_finish(entry.task);
                }
            }
        }
    }

    fn requeue_or_finish(&mut self, mut task: Task) {
        if task.attempts() >= self.config.retry_max {
            let mut timing = task.timing();
            timing.finish_micros = micros_now();
            task.complete(TaskResultKind::Aborted, None, Vec::new(), timing);
            self.deliver_completed(task);
        } else {
            self.waiting.push_back(task);
        }
    }

    fn deliver_completed(&mut self, task: Task) {
        if matches!(task.result(), Some(TaskResultKind::Success)) {
            self.record_success_duration(
                task.timing()
                    .finish_micros
                    .saturating_sub(task.timing().start_micros),
            );
        }
        if let Some((_, waiter)) = self.waiters.pop_front() {
            let _ = waiter.send(Some(task));
        } else {
            self.completed.push_back(task);
        }
    }

    fn apply_fast_abort(&mut self) {
        let Some(k) = self.config.fast_abort_multiplier else {
            return;
        };
        if self.avg_count == 0 {
            return;
        }
        let limit = Duration::from_micros((self.avg_mean_micros * k).max(0.0) as u64);
        let now = Instant::now();
        let timed_out: Vec<SessionId> = self
            .running
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.started) > limit)
            .map(|(id, _)| *id)
            .collect();

        for session in timed_out {
            if let Some(entry) = self.running.remove(&session) {
                if let Some(slot) = self.workers[session].take() {
                    slot.join.abort();
                }
                self.requeue_or_finish(entry.task);
            }
        }
    }

    fn remove_worker(&mut self, session: SessionId, carried_task: Option<Task>) {
        if let Some(entry) = self.running.remove(&session) {
            self.requeue_or_finish(carried_task.unwrap_or(entry.task));
        } else if let Some(task) = carried_task {
            self.requeue_or_finish(task);
        }
        if let Some(slot) = self.workers.get_mut(session) {
            *slot = None;
        }
    }

    fn check_waiters(&mut self) {
        let now = Instant::now();
        while let Some((deadline, _)) = self.waiters.front() {
            if *deadline > now {
                break;
            }
            if let Some(task) = self.completed.pop_front() {
                let (_, waiter) = self.waiters.pop_front().unwrap();
                let _ = waiter.send(Some(task));
            } else {
                let (_, waiter) = self.waiters.pop_front().unwrap();
                let _ = waiter.send(None);
            }
        }
    }
}

async fn run_core(
    listener: TcpListener,
    config: QueueConfig,
    mut cmd_rx: mpsc::Receiver<QueueCommand>,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerSessionEvent>();
    let mut core = Core {
        workers: Vec::new(),
        event_tx,
        waiting: VecDeque::new(),
        running: HashMap::new(),
        completed: VecDeque::new(),
        waiters: VecDeque::new(),
        next_task_id: 1,
        avg_count: 0,
        avg_mean_micros: 0.0,
        stats: QueueStats::default(),
        config,
        shutting_down: false,
    };

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((stream, _addr)) = accepted {
                    let session_id = core.workers.len();
                    let (cmd_tx, session_rx) = mpsc::channel(4);
                    let join = tokio::spawn(run_worker_session(
                        stream,
                        session_id,
                        session_rx,
                        core.event_tx.clone(),
                        core.config.keepalive_timeout,
                    ));
                    core.workers.push(Some(WorkerSlot {
                        info: None,
                        state: WorkerState::Init,
                        cmd_tx,
                        join,
                        failures: 0,
                        last_active: Instant::now(),
                    }));
                }
            }
            Some(event) = event_rx.recv() => {
                match event {
                    WorkerSessionEvent::Ready { session, info } => {
                        if let Some(Some(slot)) = core.workers.get_mut(session) {
                            slot.info = Some(info);
                            slot.state = WorkerState::Ready;
                            slot.last_active = Instant::now();
                        }
                    }
                    WorkerSessionEvent::Completed { session, task } => {
                        core.running.remove(&session);
                        if let Some(Some(slot)) = core.workers.get_mut(session) {
                            slot.state = WorkerState::Ready;
                            slot.last_active = Instant::now();
                        }
                        core.deliver_completed(task);
                    }
                    WorkerSessionEvent::Dead { session, reason: _, in_flight } => {
                        core.remove_worker(session, in_flight);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(QueueCommand::Submit(mut task, reply)) => {
                        if core.shutting_down {
                            let _ = reply.send(Err(QueueError::ShuttingDown));
                        } else {
                            task.set_id(core.next_task_id);
                            core.next_task_id += 1;
                            let id = task.id();
                            core.waiting.push_back(task);
                            let _ = reply.send(Ok(id));
                        }
                    }
                    Some(QueueCommand::Wait { timeout, reply }) => {
                        if let Some(task) = core.completed.pop_front() {
                            let _ = reply.send(Some(task));
                        } else if core.shutting_down {
                            let _ = reply.send(None);
                        } else if timeout == Duration::ZERO {
                            let _ = reply.send(None);
                        } else {
                            core.waiters.push_back((Instant::now() + timeout, reply));
                        }
                    }
                    Some(QueueCommand::Hungry(reply)) => {
                        let _ = reply.send(core.hungry());
                    }
                    Some(QueueCommand::Empty(reply)) => {
                        let _ = reply.send(core.empty());
                    }
                    Some(QueueCommand::ShutdownWorkers { n, reply }) => {
                        let target: Vec<usize> = core
                            .workers
                            .iter()
                            .enumerate()
                            .filter_map(|(i, slot)| match slot {
                                Some(w) if matches!(w.state, WorkerState::Ready) => Some(i),
                                _ => None,
                            })
                            .take(if n == 0 { usize::MAX } else { n })
                            .collect();
                        for &idx in &target {
                            if let Some(Some(slot)) = core.workers.get(idx) {
                                let _ = slot.cmd_tx.try_send(WorkerSessionCommand::Exit);
                            }
                            if let Some(slot) = core.workers.get_mut(idx) {
                                *slot = None;
                            }
                        }
                        let _ = reply.send(target.len());
                    }
                    Some(QueueCommand::Stats(reply)) => {
                        core.refresh_stats();
                        let _ = reply.send(core.stats.clone());
                    }
                    Some(QueueCommand::Terminate) => {
                        core.shutting_down = true;
                        while let Some((_, waiter)) = core.waiters.pop_front() {
                            let _ = waiter.send(None);
                        }
                    }
                }
            }
            _ = tick.tick() => {
                core.dispatch_ready_workers();
                core.apply_fast_abort();
                core.check_waiters();
                core.refresh_stats();
            }
        }

        if core.shutting_down && core.workers.iter().all(Option::is_none) {
            break;
        }
    }
    Ok(())
}

fn micros_now() -> u64 {
    chrono::Utc::now()
        .timestamp_micros()
        .try_into()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CachePolicy;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    /// Speaks just enough of the worker side of the protocol to run one
    /// task: handshake, accept a `put`, run the `work` header, and reply
    /// with a canned successful result and no outputs.
    async fn fake_worker(addr: std::net::SocketAddr) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"ready fakehost 1 1 4096 4096\n")
            .await
            .unwrap();

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("put") => {
                    let len: usize = parts.next().unwrap().parse().unwrap();
                    let mut buf = vec![0u8; len];
                    reader.read_exact(&mut buf).await.unwrap();
                }
                Some("work") => {
                    let cmd_len: usize = parts.next().unwrap().parse().unwrap();
                    let outputs: usize = parts.next().unwrap().parse().unwrap();
                    let mut cmd = vec![0u8; cmd_len];
                    reader.read_exact(&mut cmd).await.unwrap();
                    for _ in 0..outputs {
                        let mut discard = String::new();
                        reader.read_line(&mut discard).await.unwrap();
                    }
                    write_half.write_all(b"result 0 0\n").await.unwrap();
                }
                Some("exit") => break,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn submits_and_completes_against_fake_worker() {
        let queue = Queue::create(0, QueueConfig::default()).await.unwrap();
        let addr = queue.local_addr();
        tokio::spawn(fake_worker(addr));

        let mut task = Task::new("echo hi");
        task.specify_input_buffer(b"payload".to_vec(), "in.txt".to_string(), CachePolicy::NoCache);
        let id = queue.submit(task).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), queue.wait(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("task should complete");
        assert_eq!(done.id(), id);
        assert_eq!(done.result(), Some(TaskResultKind::Success));
    }

    #[tokio::test]
    async fn hungry_reports_true_with_no_ready_workers_and_waiting_tasks() {
        let queue = Queue::create(0, QueueConfig::default()).await.unwrap();
        assert!(queue.hungry().await);
        assert!(queue.empty().await);
    }

    #[tokio::test]
    async fn rejects_oversized_command_line_without_transferring_anything() {
        let queue = Queue::create(0, QueueConfig::default()).await.unwrap();
        let oversized = "x".repeat(MAX_COMMAND_LINE_BYTES + 1);
        let task = Task::new(oversized);
        let result = queue.submit(task).await;
        assert!(matches!(result, Err(QueueError::InvalidArgument)));
    }
}
