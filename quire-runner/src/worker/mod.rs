// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker process.
//!
//! A worker is the same user binary re-executed with the hidden worker
//! subcommand. It re-registers the session, intercepts stdio, then serves
//! `Run` batches from stdin until it is told to stop: building worker-scoped
//! fixtures lazily, running each test through the lifecycle in
//! [`runtime`], and streaming results back over the saved stdout.

mod runtime;
mod stdio;

pub(crate) use runtime::*;
pub(crate) use stdio::*;

use crate::{
    errors::serialize_error,
    fixtures::{FixtureRegistry, FixtureSet},
    protocol::{ControllerMessage, WorkerMessage, decode_line},
    session::Session,
};
use quire_metadata::ReportError;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Runs the worker protocol loop to completion. Invoked by the CLI layer
/// when the hidden worker subcommand is present; the return value is the
/// process exit code.
pub fn worker_main(session: Session) -> i32 {
    let capture = Capture::new();
    let writer = match stdio::install(&capture) {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("quire worker: failed to take over stdio: {err}");
            return 1;
        }
    };
    let panic_slot = PanicSlot::default();
    panic_slot.install(capture.clone());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = writer.send(&WorkerMessage::WorkerError {
                error: serialize_error(&err),
            });
            return 1;
        }
    };

    runtime.block_on(run_loop(session, writer, capture, panic_slot))
}

async fn run_loop(
    session: Session,
    writer: MessageWriter,
    capture: Capture,
    panic_slot: PanicSlot,
) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state: Option<WorkerRuntime> = None;
    let mut exit_code = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or a broken pipe: the controller is gone; shut down.
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode_line::<ControllerMessage>(&line) {
            Ok(message) => message,
            Err(err) => {
                let _ = writer.send(&WorkerMessage::WorkerError {
                    error: serialize_error(&err),
                });
                exit_code = 1;
                continue;
            }
        };
        match message {
            ControllerMessage::Run { config, tests } => {
                match &state {
                    Some(runtime) if runtime.worker_hash() != config.worker_hash => {
                        let _ = writer.send(&WorkerMessage::WorkerError {
                            error: ReportError {
                                message: format!(
                                    "worker hash changed mid-lifetime: {} -> {}",
                                    runtime.worker_hash(),
                                    config.worker_hash
                                ),
                                ..ReportError::default()
                            },
                        });
                        exit_code = 1;
                        let _ = writer.send(&WorkerMessage::Done);
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        match build_runtime(
                            &session,
                            *config,
                            writer.clone(),
                            capture.clone(),
                            panic_slot.clone(),
                        ) {
                            Ok(runtime) => {
                                debug!("worker runtime initialized");
                                state = Some(runtime);
                            }
                            Err(error) => {
                                let _ = writer.send(&WorkerMessage::WorkerError { error });
                                let _ = writer.send(&WorkerMessage::Done);
                                exit_code = 1;
                                continue;
                            }
                        }
                    }
                }
                let runtime = state.as_mut().expect("initialized above");
                for spec in tests {
                    if runtime.run_one(spec).await.is_err() {
                        // The controller hung up; no point continuing.
                        return 1;
                    }
                }
                if writer.send(&WorkerMessage::Done).is_err() {
                    return 1;
                }
            }
            ControllerMessage::Stop => break,
        }
    }

    if let Some(mut runtime) = state {
        if runtime.shutdown().await.is_err() {
            exit_code = 1;
        }
    }
    exit_code
}

fn build_runtime(
    session: &Session,
    config: crate::protocol::ConfigSlice,
    writer: MessageWriter,
    capture: Capture,
    panic_slot: PanicSlot,
) -> Result<WorkerRuntime, ReportError> {
    let base = session
        .base_fixtures()
        .map_err(|err| serialize_error(&err))?;
    let project_fixtures = session.config().project_fixtures(&config.project_name);
    let set =
        FixtureSet::union(&base, &project_fixtures).map_err(|err| serialize_error(&err))?;
    let registry = FixtureRegistry::build(set).map_err(|err| serialize_error(&err))?;
    let files = Arc::new(session.load_files());
    Ok(WorkerRuntime::new(
        files, registry, config, writer, capture, panic_slot,
    ))
}
