// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker pool: spawning, reuse, retirement.
//!
//! Workers are re-executions of the current binary with the hidden worker
//! subcommand. Each worker serves exactly one worker hash. A free worker
//! whose hash matches the next group is reused; otherwise the
//! least-recently-used free worker is retired to make room. Workers are
//! also retired after an unexpectedly failing test so corrupted fixture
//! state cannot leak into later tests.

use crate::{
    errors::WorkerError,
    protocol::{ControllerMessage, WorkerMessage, decode_line, encode_line},
};
use indexmap::IndexMap;
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc::UnboundedSender,
};
use tracing::{debug, warn};

/// The hidden subcommand that switches the user binary into worker mode.
pub const WORKER_SUBCOMMAND: &str = "__quire-worker";

/// Events surfaced from worker processes to the dispatcher.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A protocol message arrived from a worker.
    Message {
        worker_index: usize,
        message: WorkerMessage,
    },
    /// A worker's stdout closed and the process exited.
    Exited {
        worker_index: usize,
        exit_code: Option<i32>,
    },
    /// A worker produced something unparseable.
    ProtocolError {
        worker_index: usize,
        error: crate::errors::ProtocolError,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkerPhase {
    /// Waiting for work; can be reused for its hash.
    Idle,
    /// Running a batch.
    Busy,
    /// Sent `Stop`; waiting for the process to exit.
    Retiring,
}

#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) index: usize,
    pub(crate) hash: u64,
    pub(crate) phase: WorkerPhase,
    /// Monotonic counter for LRU retirement.
    pub(crate) last_used: u64,
    child: Child,
    stdin: ChildStdin,
}

/// Spawns and tracks worker processes. The number of live processes
/// (including retiring ones) never exceeds the configured limit; the
/// dispatcher enforces this by waiting for `Exited` events before spawning
/// replacements.
pub(crate) struct WorkerPool {
    exe: std::path::PathBuf,
    event_tx: UnboundedSender<PoolEvent>,
    workers: IndexMap<usize, WorkerHandle>,
    next_index: usize,
    use_counter: u64,
}

impl WorkerPool {
    pub(crate) fn new(
        exe: std::path::PathBuf,
        event_tx: UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            exe,
            event_tx,
            workers: IndexMap::new(),
            next_index: 0,
            use_counter: 0,
        }
    }

    /// Number of live workers, including retiring ones.
    pub(crate) fn live_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&index)
    }

    /// An idle worker serving `hash`, if any.
    pub(crate) fn idle_with_hash(&self, hash: u64) -> Option<usize> {
        self.workers
            .values()
            .find(|w| w.phase == WorkerPhase::Idle && w.hash == hash)
            .map(|w| w.index)
    }

    /// The least-recently-used idle worker, if any.
    pub(crate) fn lru_idle(&self) -> Option<usize> {
        self.workers
            .values()
            .filter(|w| w.phase == WorkerPhase::Idle)
            .min_by_key(|w| w.last_used)
            .map(|w| w.index)
    }

    /// Spawns a worker for `hash` and returns its index.
    pub(crate) fn spawn_worker(&mut self, hash: u64) -> Result<usize, WorkerError> {
        let index = self.next_index;
        self.next_index += 1;

        let mut child = Command::new(&self.exe)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take().expect("stdin piped above");
        let stdout = child.stdout.take().expect("stdout piped above");

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let event = match decode_line::<WorkerMessage>(&line) {
                            Ok(message) => PoolEvent::Message {
                                worker_index: index,
                                message,
                            },
                            Err(error) => PoolEvent::ProtocolError {
                                worker_index: index,
                                error,
                            },
                        };
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Stdout closed: the worker exited (or is about to).
            let _ = event_tx.send(PoolEvent::Exited {
                worker_index: index,
                exit_code: None,
            });
        });

        self.use_counter += 1;
        debug!(worker_index = index, hash, "spawned worker");
        self.workers.insert(
            index,
            WorkerHandle {
                index,
                hash,
                phase: WorkerPhase::Idle,
                last_used: self.use_counter,
                child,
                stdin,
            },
        );
        Ok(index)
    }

    /// Sends a message to a worker and marks it busy for `Run` messages.
    pub(crate) async fn send(
        &mut self,
        index: usize,
        message: &ControllerMessage,
    ) -> Result<(), WorkerError> {
        let handle = self
            .workers
            .get_mut(&index)
            .expect("send to a live worker");
        let line = encode_line(message).expect("protocol messages always serialize");
        self.use_counter += 1;
        handle.last_used = self.use_counter;
        if matches!(message, ControllerMessage::Run { .. }) {
            handle.phase = WorkerPhase::Busy;
        }
        handle
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|source| WorkerError::Protocol {
                worker_index: index,
                source: source.into(),
            })
    }

    /// Marks a worker idle after it finished a batch.
    pub(crate) fn mark_idle(&mut self, index: usize) {
        if let Some(handle) = self.workers.get_mut(&index) {
            handle.phase = WorkerPhase::Idle;
        }
    }

    /// Asks a worker to shut down cleanly. The process slot stays occupied
    /// until its `Exited` event arrives.
    pub(crate) async fn retire(&mut self, index: usize) {
        let is_live = self.workers.contains_key(&index);
        if !is_live {
            return;
        }
        debug!(worker_index = index, "retiring worker");
        if self.send(index, &ControllerMessage::Stop).await.is_err() {
            // Can't reach it; kill instead.
            self.kill(index).await;
            return;
        }
        if let Some(handle) = self.workers.get_mut(&index) {
            handle.phase = WorkerPhase::Retiring;
        }
    }

    /// Removes a worker slot after its process exited.
    pub(crate) async fn reap(&mut self, index: usize) -> Option<i32> {
        let mut handle = self.workers.shift_remove(&index)?;
        match handle.child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(worker_index = index, "failed to reap worker: {err}");
                None
            }
        }
    }

    /// Kills a worker immediately.
    pub(crate) async fn kill(&mut self, index: usize) {
        if let Some(mut handle) = self.workers.shift_remove(&index) {
            let _ = handle.child.start_kill();
            let _ = handle.child.wait().await;
        }
    }

    /// Asks every live worker to stop.
    pub(crate) async fn retire_all(&mut self) {
        let indices: Vec<usize> = self.workers.keys().copied().collect();
        for index in indices {
            if self
                .workers
                .get(&index)
                .is_some_and(|w| w.phase != WorkerPhase::Retiring)
            {
                self.retire(index).await;
            }
        }
    }

    /// Kills every live worker.
    pub(crate) async fn kill_all(&mut self) {
        let indices: Vec<usize> = self.workers.keys().copied().collect();
        for index in indices {
            self.kill(index).await;
        }
    }
}
