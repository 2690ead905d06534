// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signal handling for the controller process.
//!
//! The first interrupt asks the run to cancel: dispatch stops and workers
//! are told to shut down. A second interrupt kills workers immediately.

use tokio::sync::mpsc;

/// The kind of signal handler to set up.
#[derive(Clone, Copy, Debug)]
pub enum SignalHandlerKind {
    /// Install handlers for SIGINT/SIGTERM (Ctrl-C on all platforms).
    Standard,
    /// No signal handling: for tests and embedding.
    Noop,
}

impl SignalHandlerKind {
    /// Builds the handler. Must be called from within a tokio runtime.
    pub(crate) fn build(self) -> SignalHandler {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => SignalHandler::noop(),
        }
    }
}

/// An event produced by the signal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignalEvent {
    /// First interrupt: cancel the run cooperatively.
    Shutdown,
    /// Second interrupt: stop waiting for in-flight work.
    Kill,
}

#[derive(Debug)]
pub(crate) struct SignalHandler {
    rx: Option<mpsc::UnboundedReceiver<SignalEvent>>,
}

impl SignalHandler {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut seen = 0u32;
            loop {
                if wait_for_interrupt().await.is_err() {
                    return;
                }
                seen += 1;
                let event = if seen == 1 {
                    SignalEvent::Shutdown
                } else {
                    SignalEvent::Kill
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
        });
        Self { rx: Some(rx) }
    }

    fn noop() -> Self {
        Self { rx: None }
    }

    /// Receives the next signal event; pends forever for a noop handler.
    pub(crate) async fn recv(&mut self) -> Option<SignalEvent> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok(()),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
