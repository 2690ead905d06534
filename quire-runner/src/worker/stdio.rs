// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker-side stdio plumbing.
//!
//! The worker's original stdout carries the message protocol, so user writes
//! to stdout/stderr must go elsewhere. On Unix the worker re-points fds 1
//! and 2 at pipes before running any user code; drain threads read the
//! pipes, attribute chunks to the currently-running test, forward them live
//! as protocol messages, and buffer them for the sealed result. On other
//! platforms only output written through `TestInfo` attachments is captured.

use crate::{
    protocol::{InstanceId, WorkerMessage, encode_line},
    reporter::events::StdioKind,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quire_metadata::OutputChunk;
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

/// The protocol writer: serializes worker messages onto the saved stdout
/// fd. Shared between the async runtime and the stdio drain threads.
#[derive(Clone)]
pub(crate) struct MessageWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl MessageWriter {
    pub(crate) fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes one message as an NDJSON line and flushes.
    pub(crate) fn send(&self, message: &WorkerMessage) -> io::Result<()> {
        let line = encode_line(message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut writer = self.inner.lock().expect("writer poisoned");
        writer.write_all(line.as_bytes())?;
        writer.flush()
    }
}

/// Shared capture state: which test chunks are attributed to, and the
/// buffered chunks for the in-flight test.
#[derive(Default)]
pub(crate) struct CaptureState {
    current: Option<InstanceId>,
    stdout: Vec<OutputChunk>,
    stderr: Vec<OutputChunk>,
}

/// Handle to the capture state shared with the drain threads.
#[derive(Clone, Default)]
pub(crate) struct Capture {
    state: Arc<Mutex<CaptureState>>,
}

impl Capture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts attributing chunks to `id` and clears the buffers.
    pub(crate) fn begin_test(&self, id: InstanceId) {
        let mut state = self.state.lock().expect("capture poisoned");
        state.current = Some(id);
        state.stdout.clear();
        state.stderr.clear();
    }

    /// Stops attribution and returns the buffered (stdout, stderr) chunks.
    pub(crate) fn end_test(&self) -> (Vec<OutputChunk>, Vec<OutputChunk>) {
        let mut state = self.state.lock().expect("capture poisoned");
        state.current = None;
        (
            std::mem::take(&mut state.stdout),
            std::mem::take(&mut state.stderr),
        )
    }

    /// True while a test is in flight.
    pub(crate) fn has_current(&self) -> bool {
        self.state.lock().expect("capture poisoned").current.is_some()
    }

    /// Records a raw chunk and returns the attribution for live forwarding.
    pub(crate) fn record(&self, kind: StdioKind, bytes: &[u8]) -> (Option<InstanceId>, OutputChunk) {
        let chunk = to_chunk(bytes);
        let mut state = self.state.lock().expect("capture poisoned");
        if state.current.is_some() {
            match kind {
                StdioKind::Stdout => state.stdout.push(chunk.clone()),
                StdioKind::Stderr => state.stderr.push(chunk.clone()),
            }
        }
        (state.current.clone(), chunk)
    }
}

/// Text writes stay text; binary writes are base64-encoded.
fn to_chunk(bytes: &[u8]) -> OutputChunk {
    match std::str::from_utf8(bytes) {
        Ok(text) => OutputChunk::Text {
            text: text.to_owned(),
        },
        Err(_) => OutputChunk::Buffer {
            buffer: BASE64.encode(bytes),
        },
    }
}

/// Takes over the process stdio. Returns the protocol writer backed by the
/// original stdout.
#[cfg(unix)]
pub(crate) fn install(capture: &Capture) -> io::Result<MessageWriter> {
    use std::fs::File;
    use std::os::fd::FromRawFd;

    // Save the real stdout for the protocol before re-pointing fd 1.
    let saved = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if saved < 0 {
        return Err(io::Error::last_os_error());
    }
    let protocol = unsafe { File::from_raw_fd(saved) };
    let writer = MessageWriter::new(Box::new(protocol));

    redirect_fd(libc::STDOUT_FILENO, StdioKind::Stdout, &writer, capture)?;
    redirect_fd(libc::STDERR_FILENO, StdioKind::Stderr, &writer, capture)?;
    Ok(writer)
}

#[cfg(unix)]
fn redirect_fd(
    fd: libc::c_int,
    kind: StdioKind,
    writer: &MessageWriter,
    capture: &Capture,
) -> io::Result<()> {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::FromRawFd;

    let mut pipe_fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let [read_fd, write_fd] = pipe_fds;
    if unsafe { libc::dup2(write_fd, fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::close(write_fd);
    }
    let mut reader = unsafe { File::from_raw_fd(read_fd) };
    let writer = writer.clone();
    let capture = capture.clone();
    let name = match kind {
        StdioKind::Stdout => "quire-stdout-drain",
        StdioKind::Stderr => "quire-stderr-drain",
    };
    std::thread::Builder::new().name(name.to_owned()).spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let (test, chunk) = capture.record(kind, &buf[..n]);
                    // A failed send means the controller is gone; the drain
                    // keeps the pipe from filling up regardless.
                    let _ = writer.send(&WorkerMessage::Stdio {
                        stream: kind,
                        test,
                        chunk,
                    });
                }
            }
        }
    })?;
    Ok(())
}

/// Non-Unix fallback: the protocol keeps plain stdout and user stdio is not
/// intercepted.
#[cfg(not(unix))]
pub(crate) fn install(_capture: &Capture) -> io::Result<MessageWriter> {
    Ok(MessageWriter::new(Box::new(io::stdout())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_classify_text_and_binary() {
        assert_eq!(
            to_chunk(b"plain text"),
            OutputChunk::Text {
                text: "plain text".to_owned()
            }
        );
        match to_chunk(&[0xff, 0xfe, 0x00]) {
            OutputChunk::Buffer { buffer } => {
                assert_eq!(BASE64.decode(buffer).unwrap(), vec![0xff, 0xfe, 0x00]);
            }
            other => panic!("expected buffer chunk, got {other:?}"),
        }
    }

    #[test]
    fn capture_attributes_chunks_to_current_test() {
        let capture = Capture::new();
        let (test, _) = capture.record(StdioKind::Stdout, b"before any test\n");
        assert!(test.is_none());

        capture.begin_test("abcd".to_owned());
        let (test, _) = capture.record(StdioKind::Stdout, b"from the test\n");
        assert_eq!(test.as_deref(), Some("abcd"));
        capture.record(StdioKind::Stderr, b"warning\n");

        let (stdout, stderr) = capture.end_test();
        assert_eq!(stdout.len(), 1);
        assert_eq!(stderr.len(), 1);

        let (test, _) = capture.record(StdioKind::Stdout, b"after\n");
        assert!(test.is_none());
    }
}
