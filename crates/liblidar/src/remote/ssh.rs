use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{Channel, ErrorCode, HashType, Session, Stream};
use tracing::debug;

use super::{
    POLL_CHUNK_BYTES, RemoteChannel, RemoteConfig, RemoteConnector, RemoteError, RemoteSession,
};

/// SFTP status code for a path that does not exist.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Opens password-authenticated SSH sessions to the device.
pub struct SshConnector {
    config: RemoteConfig,
}

impl SshConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn resolve(&self) -> Result<SocketAddr, RemoteError> {
        let host = self.config.host.as_str();
        (host, self.config.port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::Connect(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| RemoteError::Connect(format!("no address for {host}")))
    }

    fn open(&self) -> Result<Session, RemoteError> {
        let addr = self.resolve()?;
        let timeout = self.config.connect_timeout();
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| RemoteError::Connect(format!("{addr}: {e}")))?;

        let mut session = Session::new()
            .map_err(|e| RemoteError::Connect(format!("cannot create ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(timeout));
        session
            .handshake()
            .map_err(|e| RemoteError::Connect(format!("handshake with {addr} failed: {e}")))?;

        if let Some(expected) = self.config.host_key_sha256.as_deref() {
            verify_host_key(&session, expected)?;
        }

        session
            .userauth_password(&self.config.user, &self.config.password)
            .map_err(|e| {
                RemoteError::Connect(format!(
                    "authentication as {} failed: {e}",
                    self.config.user
                ))
            })?;
        if !session.authenticated() {
            return Err(RemoteError::Connect(format!(
                "authentication as {} was not accepted",
                self.config.user
            )));
        }

        debug!(%addr, user = %self.config.user, "ssh session established");
        Ok(session)
    }
}

impl RemoteConnector for SshConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let session = self.open()?;
        Ok(Box::new(SshSession {
            session,
            transfer_timeout: self.config.transfer_timeout(),
        }))
    }
}

fn verify_host_key(session: &Session, expected: &str) -> Result<(), RemoteError> {
    let observed = session
        .host_key_hash(HashType::Sha256)
        .map(hex::encode)
        .ok_or_else(|| RemoteError::Connect("host key hash unavailable".to_string()))?;
    let expected = expected.replace(':', "").to_ascii_lowercase();
    if observed != expected {
        return Err(RemoteError::Connect(format!(
            "host key mismatch (expected {expected}, got {observed})"
        )));
    }
    Ok(())
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

struct SshSession {
    session: Session,
    transfer_timeout: Duration,
}

impl RemoteSession for SshSession {
    fn execute(&mut self, command: &str) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| RemoteError::Channel(format!("cannot open channel: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| RemoteError::Channel(format!("exec failed: {e}")))?;
        let stderr = channel.stderr();
        self.session.set_blocking(false);

        Ok(Box::new(SshChannel {
            session: self.session.clone(),
            channel,
            stderr,
            closed: false,
            exit_code: None,
        }))
    }

    fn fetch_file(&mut self, remote_path: &str) -> Result<Vec<u8>, RemoteError> {
        self.session.set_blocking(true);
        self.session.set_timeout(millis(self.transfer_timeout));

        let sftp = self
            .session
            .sftp()
            .map_err(|e| RemoteError::Transfer(format!("cannot start sftp: {e}")))?;
        let mut file = sftp.open(Path::new(remote_path)).map_err(|e| {
            if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) {
                RemoteError::NotFound(remote_path.to_string())
            } else {
                RemoteError::Transfer(format!("{remote_path}: {e}"))
            }
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| RemoteError::Transfer(format!("{remote_path}: {e}")))?;
        Ok(bytes)
    }
}

/// A command channel. The owning session is switched to non-blocking mode
/// once the command is running so reads return immediately.
struct SshChannel {
    session: Session,
    channel: Channel,
    stderr: Stream,
    closed: bool,
    exit_code: Option<i32>,
}

fn read_chunk(reader: &mut impl Read) -> Result<Option<Vec<u8>>, RemoteError> {
    let mut buf = vec![0u8; POLL_CHUNK_BYTES];
    match reader.read(&mut buf) {
        Ok(0) => Ok(None),
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(RemoteError::Channel(format!("read failed: {err}"))),
    }
}

impl RemoteChannel for SshChannel {
    fn poll_stdout(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        if self.closed {
            return Ok(None);
        }
        read_chunk(&mut self.channel)
    }

    fn poll_stderr(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        if self.closed {
            return Ok(None);
        }
        read_chunk(&mut self.stderr)
    }

    fn is_exit_ready(&mut self) -> bool {
        self.exit_code.is_some() || self.channel.eof()
    }

    fn exit_status(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            // Bounded by the session timeout.
            self.session.set_blocking(true);
            if let Err(err) = self.channel.wait_close() {
                debug!("wait_close failed: {err}");
            }
            self.exit_code = self.channel.exit_status().ok();
            self.session.set_blocking(false);
        }
        self.exit_code
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        if self.closed {
            return Ok(());
        }
        self.session.set_blocking(true);
        let result = self.channel.close();
        self.session.set_blocking(false);
        match result {
            Ok(()) => {
                self.closed = true;
                Ok(())
            }
            Err(err) => Err(RemoteError::Channel(format!("close failed: {err}"))),
        }
    }
}
