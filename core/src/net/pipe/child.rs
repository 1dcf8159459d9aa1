//! Server subprocess over stdin/stdout
//!
//! Frames are written to the child's stdin from the relay thread. A reader
//! thread blocks on the child's stdout and hands decoded messages over an
//! `mpsc` channel, so the relay tick never waits on the subprocess.

use std::ffi::OsStr;
use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{PipeError, PipeMessage, ServerPipe, read_frame, write_frame};

/// How long `close` waits for the child to exit on its own
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// A spawned dedicated server
pub struct ChildProcessPipe {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    inbox: Receiver<PipeMessage>,
    reader_thread: Option<JoinHandle<()>>,
    /// Set once the reader hit end of stream or a write failed
    broken: bool,
}

impl ChildProcessPipe {
    /// Spawn `program` with `args`; stderr is inherited.
    pub fn spawn<S: AsRef<OsStr>>(program: S, args: &[String]) -> Result<Self, PipeError> {
        let mut child = Command::new(program.as_ref())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipeError::Io(format!("Failed to spawn {:?}: {}", program.as_ref(), e)))?;

        let stdin = child.stdin.take().ok_or(PipeError::Closed)?;
        let stdout = child.stdout.take().ok_or(PipeError::Closed)?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name("tidewire-server-pipe".to_string())
            .spawn(move || reader_loop(stdout, tx))
            .map_err(|e| PipeError::Io(e.to_string()))?;

        tracing::info!(pid = child.id(), "Server subprocess started");

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            inbox: rx,
            reader_thread: Some(reader_thread),
            broken: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl ServerPipe for ChildProcessPipe {
    fn send(&mut self, message: &PipeMessage) -> Result<(), PipeError> {
        let stdin = self.stdin.as_mut().ok_or(PipeError::Closed)?;
        if let Err(e) = write_frame(stdin, message) {
            self.broken = true;
            return Err(e);
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<PipeMessage> {
        match self.inbox.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.broken = true;
                None
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.broken || self.stdin.is_none() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::error!(%status, "Server subprocess exited");
                self.broken = true;
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to query server subprocess");
                self.broken = true;
                false
            }
        }
    }

    fn close(&mut self) {
        // Closing stdin is the shutdown signal
        if self.stdin.take().is_none() {
            return;
        }

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => {
                    tracing::warn!(pid = self.child.id(), "Killing server subprocess");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }

        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        self.broken = true;
    }
}

impl Drop for ChildProcessPipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChildProcessPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessPipe")
            .field("pid", &self.child.id())
            .field("open", &self.stdin.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

/// Reader thread: read frames until end of stream, push to channel.
fn reader_loop(stdout: ChildStdout, tx: Sender<PipeMessage>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(message)) => {
                if tx.send(message).is_err() {
                    break; // Relay dropped the receiver
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Server pipe read failed");
                break;
            }
        }
    }
}
