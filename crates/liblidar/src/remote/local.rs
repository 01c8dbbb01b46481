use std::io::{ErrorKind, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use tracing::debug;

use super::{POLL_CHUNK_BYTES, RemoteChannel, RemoteConnector, RemoteError, RemoteSession};

/// Runs commands with `sh -c` on this machine and reads files from the local
/// filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteConnector for LocalConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(Box::new(LocalSession))
    }
}

struct LocalSession;

impl RemoteSession for LocalSession {
    fn execute(&mut self, command: &str) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RemoteError::Channel(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::Channel("stdout pipe missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RemoteError::Channel("stderr pipe missing".to_string()))?;

        debug!(pid = child.id(), "local command started");
        Ok(Box::new(LocalChannel {
            child,
            stdout: PipeReader::spawn(stdout),
            stderr: PipeReader::spawn(stderr),
            status: None,
        }))
    }

    fn fetch_file(&mut self, remote_path: &str) -> Result<Vec<u8>, RemoteError> {
        std::fs::read(remote_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(remote_path.to_string()),
            _ => RemoteError::Transfer(format!("{remote_path}: {e}")),
        })
    }
}

/// Drains a pipe on its own thread so polls never block.
struct PipeReader {
    rx: Receiver<std::io::Result<Vec<u8>>>,
    done: bool,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = vec![0u8; POLL_CHUNK_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        });
        Self { rx, done: false }
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.try_recv() {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(err)) => {
                self.done = true;
                Err(RemoteError::Channel(format!("read failed: {err}")))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

struct LocalChannel {
    child: Child,
    stdout: PipeReader,
    stderr: PipeReader,
    status: Option<ExitStatus>,
}

impl RemoteChannel for LocalChannel {
    fn poll_stdout(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.stdout.poll()
    }

    fn poll_stderr(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.stderr.poll()
    }

    fn is_exit_ready(&mut self) -> bool {
        if self.status.is_none() {
            self.status = self.child.try_wait().ok().flatten();
        }
        // Both pipes must hit EOF so no output is left behind.
        self.status.is_some() && self.stdout.done && self.stderr.done
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(RemoteError::Channel(format!("kill failed: {err}"))),
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
