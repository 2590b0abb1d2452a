//! SSH sessions over libssh2
//!
//! Each session owns a worker thread holding the blocking `ssh2::Session` and a
//! single shell channel. The async side submits requests over a channel and
//! receives replies and command output back over tokio channels. Commands are
//! written to the shell followed by an `echo` of a marker and `$?`, which is how
//! the worker finds the end of a command and its exit status.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use ssh2::{Channel, ExtendedData, Session};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::models::target::{AuthMethod, TargetHost};
use crate::transport::{CommandOutput, Connector, OutputEvent, RemoteSession, TransportError};

const DONE_MARKER: &str = "__LABDEPLOY_DONE__:";

/// Read timeout of the shell channel; a read that times out means "no data yet"
const POLL_INTERVAL_MS: u32 = 200;

type Reply = oneshot::Sender<Result<(), TransportError>>;

/// Opens SSH sessions, accepting any host key
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &TargetHost) -> Result<Box<dyn RemoteSession>, TransportError> {
        let credentials = match &target.auth {
            Some(AuthMethod::KeyFile(path)) => Credentials::KeyFile(path.clone()),
            Some(AuthMethod::Password(password)) => {
                Credentials::Password(SecretString::from(password.expose_secret().to_owned()))
            }
            None => {
                return Err(TransportError::Authentication(format!(
                    "no key file or password configured for {}",
                    target.id
                )))
            }
        };

        let params = ConnectParams {
            address: target.address.clone(),
            port: target.port,
            username: target.username.clone(),
            credentials,
            connect_timeout: self.connect_timeout,
            io_timeout: self.command_timeout,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (requests, request_rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name(format!("ssh-{}", target.id))
            .spawn(move || worker(params, request_rx, ready_tx))
            .map_err(|e| {
                TransportError::Connection(format!("failed to start session worker: {}", e))
            })?;

        ready_rx.await.unwrap_or_else(|_| Err(worker_gone()))?;
        info!("SSH session established to {}:{}", target.address, target.port);

        Ok(Box::new(SshSession {
            requests,
            command_timeout: self.command_timeout,
            closed: false,
        }))
    }
}

/// Async handle to a session worker
pub struct SshSession {
    requests: std_mpsc::Sender<Request>,
    command_timeout: Duration,
    closed: bool,
}

impl SshSession {
    fn submit(&self, request: Request) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed("session already closed".to_string()));
        }
        self.requests.send(request).map_err(|_| worker_gone())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Put {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reply,
        })?;
        rx.await.unwrap_or_else(|_| Err(worker_gone()))
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        let (output, rx) = mpsc::unbounded_channel();
        self.submit(Request::Execute {
            command: command.to_string(),
            output,
        })?;
        Ok(CommandOutput::new(rx, Some(self.command_timeout)))
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Send {
            text: text.to_string(),
            reply,
        })?;
        rx.await.unwrap_or_else(|_| Err(worker_gone()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Close { reply })?;
        self.closed = true;
        rx.await.unwrap_or_else(|_| Err(worker_gone()))
    }
}

fn worker_gone() -> TransportError {
    TransportError::Closed("session worker has stopped".to_string())
}

// ================================ WORKER ======================================= //

enum Credentials {
    KeyFile(PathBuf),
    Password(SecretString),
}

struct ConnectParams {
    address: String,
    port: u16,
    username: String,
    credentials: Credentials,
    connect_timeout: Duration,
    io_timeout: Duration,
}

enum Request {
    Put {
        local: PathBuf,
        remote: String,
        reply: Reply,
    },
    Execute {
        command: String,
        output: mpsc::UnboundedSender<OutputEvent>,
    },
    Send {
        text: String,
        reply: Reply,
    },
    Close {
        reply: Reply,
    },
}

fn worker(
    params: ConnectParams,
    requests: std_mpsc::Receiver<Request>,
    ready: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut shell = match Shell::open(&params) {
        Ok(shell) => {
            let _ = ready.send(Ok(()));
            shell
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Requests that arrived while a command was running
    let mut backlog = VecDeque::new();

    loop {
        let request = match backlog.pop_front() {
            Some(request) => request,
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        match request {
            Request::Put {
                local,
                remote,
                reply,
            } => {
                let _ = reply.send(shell.put(&local, &remote));
            }
            Request::Execute { command, output } => {
                if !shell.execute(&command, &output, &requests, &mut backlog) {
                    return;
                }
            }
            Request::Send { text, reply } => {
                let _ = reply.send(shell.write(&text));
            }
            Request::Close { reply } => {
                let _ = reply.send(shell.close());
                return;
            }
        }
    }

    // Handle dropped without an explicit close
    if let Err(e) = shell.close() {
        debug!("Closing abandoned SSH session: {}", e);
    }
}

/// A request that must be answered while a command is still running
enum Interrupt {
    Send { text: String, reply: Reply },
    Close { reply: Reply },
    /// Every handle to the session is gone
    Abandoned,
}

/// Poll for an interrupt without blocking. Uploads and commands wait in `backlog`.
fn next_interrupt(
    requests: &std_mpsc::Receiver<Request>,
    backlog: &mut VecDeque<Request>,
) -> Option<Interrupt> {
    loop {
        match requests.try_recv() {
            Ok(Request::Send { text, reply }) => return Some(Interrupt::Send { text, reply }),
            Ok(Request::Close { reply }) => return Some(Interrupt::Close { reply }),
            Ok(other) => backlog.push_back(other),
            Err(std_mpsc::TryRecvError::Empty) => return None,
            Err(std_mpsc::TryRecvError::Disconnected) => return Some(Interrupt::Abandoned),
        }
    }
}

struct Shell {
    session: Session,
    channel: Channel,
    pending: Vec<u8>,
    io_timeout: Duration,

    /// Set once the shell can no longer run commands
    broken: Option<String>,
}

impl Shell {
    fn open(params: &ConnectParams) -> Result<Self, TransportError> {
        let addr = (params.address.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| {
                TransportError::Connection(format!("cannot resolve {}: {}", params.address, e))
            })?
            .next()
            .ok_or_else(|| {
                TransportError::Connection(format!("no address found for {}", params.address))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, params.connect_timeout).map_err(|e| {
            TransportError::Connection(format!("failed to connect to {}: {}", addr, e))
        })?;

        let mut session = Session::new().map_err(|e| TransportError::Connection(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(params.connect_timeout));
        session
            .handshake()
            .map_err(|e| TransportError::Connection(format!("SSH handshake failed: {}", e)))?;

        match session.host_key() {
            Some((key, _)) => info!(
                "Accepting host key of {} ({})",
                params.address,
                fingerprint_sha256(key)
            ),
            None => warn!("{} presented no host key", params.address),
        }

        match &params.credentials {
            Credentials::KeyFile(path) => session
                .userauth_pubkey_file(&params.username, None, path, None)
                .map_err(|e| {
                    TransportError::Authentication(format!(
                        "key {} rejected: {}",
                        path.display(),
                        e
                    ))
                })?,
            Credentials::Password(password) => session
                .userauth_password(&params.username, password.expose_secret())
                .map_err(|e| {
                    TransportError::Authentication(format!(
                        "password rejected for {}: {}",
                        params.username, e
                    ))
                })?,
        }
        if !session.authenticated() {
            return Err(TransportError::Authentication(format!(
                "server did not accept credentials for {}",
                params.username
            )));
        }

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Connection(format!("failed to open channel: {}", e)))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        channel
            .shell()
            .map_err(|e| TransportError::Connection(format!("failed to start shell: {}", e)))?;

        session.set_timeout(POLL_INTERVAL_MS);

        Ok(Self {
            session,
            channel,
            pending: Vec::new(),
            io_timeout: params.io_timeout,
            broken: None,
        })
    }

    fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.session.set_timeout(millis(self.io_timeout));
        let result = upload(&self.session, local, remote);
        self.session.set_timeout(POLL_INTERVAL_MS);
        result
    }

    fn write(&mut self, text: &str) -> Result<(), TransportError> {
        if let Some(reason) = &self.broken {
            return Err(TransportError::Closed(reason.clone()));
        }
        self.session.set_timeout(millis(self.io_timeout));
        let mut result = self.channel.write_all(text.as_bytes());
        if result.is_ok() {
            result = self.channel.flush();
        }
        self.session.set_timeout(POLL_INTERVAL_MS);
        result.map_err(|e| TransportError::Closed(format!("write to shell failed: {}", e)))
    }

    /// Run one command, forwarding its output. Returns `false` once the session is closed.
    fn execute(
        &mut self,
        command: &str,
        output: &mpsc::UnboundedSender<OutputEvent>,
        requests: &std_mpsc::Receiver<Request>,
        backlog: &mut VecDeque<Request>,
    ) -> bool {
        let script = format!("{}\necho \"{}$?\"\n", command, DONE_MARKER);
        if let Err(e) = self.write(&script) {
            let _ = output.send(OutputEvent::Error(e));
            return true;
        }

        let mut buf = [0u8; 4096];
        loop {
            while let Some(interrupt) = next_interrupt(requests, backlog) {
                match interrupt {
                    Interrupt::Send { text, reply } => {
                        let _ = reply.send(self.write(&text));
                    }
                    Interrupt::Close { reply } => {
                        let _ = output.send(OutputEvent::Error(TransportError::Closed(
                            "session closed while a command was running".to_string(),
                        )));
                        let _ = reply.send(self.close());
                        return false;
                    }
                    Interrupt::Abandoned => {
                        let _ = output.send(OutputEvent::Error(TransportError::Closed(
                            "session handle dropped while a command was running".to_string(),
                        )));
                        if let Err(e) = self.close() {
                            debug!("Closing abandoned SSH session: {}", e);
                        }
                        return false;
                    }
                }
            }

            match self.channel.read(&mut buf) {
                Ok(0) if self.channel.eof() => {
                    self.flush_partial(output);
                    let reason = "remote shell exited".to_string();
                    let _ = output.send(OutputEvent::Error(TransportError::Closed(reason.clone())));
                    self.broken = Some(reason);
                    return true;
                }
                Ok(0) => std::thread::sleep(Duration::from_millis(10)),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(status) = self.drain_lines(output) {
                        let _ = output.send(OutputEvent::Exit(status));
                        return true;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) => {
                    let reason = format!("read from shell failed: {}", e);
                    let _ = output.send(OutputEvent::Error(TransportError::Closed(reason.clone())));
                    self.broken = Some(reason);
                    return true;
                }
            }
        }
    }

    /// Forward complete lines; returns the exit status once the marker is seen
    fn drain_lines(&mut self, output: &mpsc::UnboundedSender<OutputEvent>) -> Option<i32> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();

            if let Some(idx) = line.find(DONE_MARKER) {
                if idx > 0 {
                    let _ = output.send(OutputEvent::Line(line[..idx].to_string()));
                }
                let status = line[idx + DONE_MARKER.len()..].trim().parse().unwrap_or(-1);
                return Some(status);
            }
            let _ = output.send(OutputEvent::Line(line));
        }
        None
    }

    fn flush_partial(&mut self, output: &mpsc::UnboundedSender<OutputEvent>) {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
            self.pending.clear();
            let _ = output.send(OutputEvent::Line(line));
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.broken = Some("session closed".to_string());
        self.session.set_timeout(millis(self.io_timeout));
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        self.session
            .disconnect(None, "labdeploy done", None)
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

fn upload(session: &Session, local: &Path, remote: &str) -> Result<(), TransportError> {
    let sftp = session
        .sftp()
        .map_err(|e| TransportError::Transfer(format!("SFTP unavailable: {}", e)))?;
    let mut source = std::fs::File::open(local)
        .map_err(|e| TransportError::Transfer(format!("cannot open {}: {}", local.display(), e)))?;
    let mut dest = sftp
        .create(Path::new(remote))
        .map_err(|e| TransportError::Transfer(format!("cannot create remote {}: {}", remote, e)))?;
    let bytes = std::io::copy(&mut source, &mut dest)
        .map_err(|e| TransportError::Transfer(format!("upload of {} failed: {}", remote, e)))?;
    debug!("Uploaded {} bytes to {}", bytes, remote);
    Ok(())
}

fn millis(duration: Duration) -> u32 {
    duration.as_millis().min(u128::from(u32::MAX)) as u32
}

/// OpenSSH style `SHA256:<base64>` fingerprint of a host key
pub fn fingerprint_sha256(key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key)))
}
