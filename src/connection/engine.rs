//! Handshake engine abstraction.
//!
//! A `HandshakeEngine` turns plaintext into TLS records (`wrap`) and back
//! (`unwrap`) and reports what the handshake needs next. The connection
//! layer only drives that state machine; certificate and trust policy live
//! entirely inside the engine's configuration.
//!
//! `RustlsEngine` adapts a `rustls::Connection` to this model. Other engines
//! (hardware offload, test doubles) plug in through `EngineFactory`.

use crate::connection::secure::SecureSession;
use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The engine has records to emit; call `wrap`, even with no plaintext.
    NeedWrap,
    /// The engine waits for records from the peer.
    NeedUnwrap,
    /// A delegated task must run before the handshake can continue.
    NeedTask,
    /// Reported exactly once, in the result of the call that completed the handshake.
    Finished,
}

/// Outcome of one `wrap`/`unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// `dst` was too small for the next record.
    BufferOverflow,
    /// More input is needed to make progress.
    BufferUnderflow,
    /// The engine is closed in this direction.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// Bytes taken from `src`.
    pub consumed: usize,
    /// Bytes written to `dst`.
    pub produced: usize,
}

impl EngineResult {
    pub fn made_progress(&self) -> bool {
        self.consumed > 0 || self.produced > 0
    }
}

/// CPU-bound work an engine hands out during the handshake.
pub type Task = Box<dyn FnOnce() + Send>;

pub trait HandshakeEngine: Send {
    /// Encrypt from `src` into `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult>;

    /// Decrypt from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Next pending delegated task, if any.
    fn delegated_task(&mut self) -> Option<Task> {
        None
    }

    /// Queue a close notification. It is emitted by following `wrap` calls.
    fn close_outbound(&mut self);
}

/// Runs delegated handshake tasks. The task must have finished when
/// `execute` returns; an executor may still run it on another thread to
/// keep CPU-heavy work off a shared core.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs tasks on the calling (dispatcher) thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Creates one engine per connection.
pub trait EngineFactory: Send + Sync {
    fn new_engine(&self) -> Result<Box<dyn HandshakeEngine>>;
}

struct RustlsServerFactory(Arc<rustls::ServerConfig>);

impl EngineFactory for RustlsServerFactory {
    fn new_engine(&self) -> Result<Box<dyn HandshakeEngine>> {
        Ok(Box::new(RustlsEngine::server(Arc::clone(&self.0))?))
    }
}

struct RustlsClientFactory {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl EngineFactory for RustlsClientFactory {
    fn new_engine(&self) -> Result<Box<dyn HandshakeEngine>> {
        Ok(Box::new(RustlsEngine::client(
            Arc::clone(&self.config),
            self.server_name.clone(),
        )?))
    }
}

/// Security context for accepted connections.
#[derive(Clone)]
pub struct TlsServer {
    factory: Arc<dyn EngineFactory>,
    executor: Arc<dyn TaskExecutor>,
}

impl TlsServer {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self::from_factory(Arc::new(RustlsServerFactory(config)))
    }

    /// Build a rustls server from a PEM certificate chain and private key.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self> {
        let open = |path: &Path| File::open(path).map(BufReader::new);

        let certs = rustls_pemfile::certs(&mut open(cert)?).collect::<io::Result<Vec<_>>>()?;
        let key = rustls_pemfile::private_key(&mut open(key)?)?.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no private key in {}", key.display()),
            ))
        })?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(Error::tls)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(Error::tls)?;
        Ok(Self::new(Arc::new(config)))
    }

    pub fn from_factory(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            executor: Arc::new(InlineExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub(crate) fn session(&self) -> Result<SecureSession> {
        Ok(SecureSession::new(
            self.factory.new_engine()?,
            Arc::clone(&self.executor),
            false,
        ))
    }
}

impl fmt::Debug for TlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsServer")
    }
}

/// Security context for outbound connections.
#[derive(Clone)]
pub struct TlsClient {
    factory: Arc<dyn EngineFactory>,
    executor: Arc<dyn TaskExecutor>,
}

impl TlsClient {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        Ok(Self::from_factory(Arc::new(RustlsClientFactory {
            config,
            server_name,
        })))
    }

    pub fn from_factory(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            executor: Arc::new(InlineExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub(crate) fn session(&self) -> Result<SecureSession> {
        Ok(SecureSession::new(
            self.factory.new_engine()?,
            Arc::clone(&self.executor),
            true,
        ))
    }
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsClient")
    }
}

/// `HandshakeEngine` over a rustls client or server connection.
pub struct RustlsEngine {
    conn: rustls::Connection,
    handshaking: bool,
    outbound_closed: bool,
    peer_closed: bool,
}

impl RustlsEngine {
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
        let conn = rustls::ClientConnection::new(config, server_name).map_err(Error::tls)?;
        Ok(Self::from_connection(conn.into()))
    }

    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(Error::tls)?;
        Ok(Self::from_connection(conn.into()))
    }

    fn from_connection(conn: rustls::Connection) -> Self {
        Self {
            handshaking: conn.is_handshaking(),
            conn,
            outbound_closed: false,
            peer_closed: false,
        }
    }

    /// Status for a call result: `Finished` once, on the transition.
    fn transition(&mut self) -> HandshakeStatus {
        if self.handshaking && !self.conn.is_handshaking() {
            self.handshaking = false;
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }
}

impl HandshakeEngine for RustlsEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        let mut consumed = 0;
        let mut status = EngineStatus::Ok;

        if !src.is_empty() {
            if self.outbound_closed {
                status = EngineStatus::Closed;
            } else if !self.conn.is_handshaking() {
                consumed = self.conn.writer().write(src)?;
            }
        }

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut out = &mut dst[produced..];
            let n = self.conn.write_tls(&mut out)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        if produced == 0 && self.conn.wants_write() {
            status = EngineStatus::BufferOverflow;
        }

        Ok(EngineResult {
            status,
            handshake: self.transition(),
            consumed,
            produced,
        })
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        let mut consumed = 0;
        if !src.is_empty() {
            let mut input = src;
            consumed = self.conn.read_tls(&mut input)?;
            let state = self.conn.process_new_packets().map_err(Error::tls)?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }

        let mut produced = 0;
        if !dst.is_empty() {
            match self.conn.reader().read(dst) {
                Ok(n) => produced = n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        let status = if produced == 0 && self.peer_closed {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult {
            status,
            handshake: self.transition(),
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match (self.conn.is_handshaking(), self.conn.wants_write()) {
            (_, true) => HandshakeStatus::NeedWrap,
            (true, false) => HandshakeStatus::NeedUnwrap,
            (false, false) => HandshakeStatus::NotHandshaking,
        }
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }
}
