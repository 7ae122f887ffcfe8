//! TLS session driving for a connection.
//!
//! `SecureSession` sits between the socket queues and a `HandshakeEngine`.
//! Ciphertext from the socket goes through `receive`, application bytes
//! through `send`; both leave their results in the queues they are given.
//!
//! No application byte moves in either direction before the engine has
//! reported `Finished`: plaintext handed to `send` early is held back and
//! wrapped right after the handshake completes, and decrypted bytes seen
//! before that point are a protocol error.

use crate::connection::engine::{
    EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus, TaskExecutor,
};
use crate::error::{Error, Result};
use crate::queue::ChunkQueue;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

/// Initial scratch size: one maximum TLS record plus overhead.
const INITIAL_BUFFER_SIZE: usize = 16 * 1024 + 2 * 1024;
/// Scratch buffers never grow beyond this.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// What a call to `receive` changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    /// The handshake completed during this call.
    pub finished: bool,
    /// The peer sent its close notification.
    pub peer_closed: bool,
}

pub(crate) struct SecureSession {
    engine: Box<dyn HandshakeEngine>,
    executor: Arc<dyn TaskExecutor>,
    wrap_buf: Vec<u8>,
    unwrap_buf: Vec<u8>,
    max_buffer: usize,
    /// Ciphertext received but not yet consumed by the engine.
    inbound: BytesMut,
    /// Plaintext submitted before the handshake finished.
    held: Vec<Bytes>,
    finished: bool,
    client: bool,
}

impl SecureSession {
    pub fn new(engine: Box<dyn HandshakeEngine>, executor: Arc<dyn TaskExecutor>, client: bool) -> Self {
        Self::with_buffer_sizes(engine, executor, client, INITIAL_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub fn with_buffer_sizes(
        engine: Box<dyn HandshakeEngine>,
        executor: Arc<dyn TaskExecutor>,
        client: bool,
        initial: usize,
        max: usize,
    ) -> Self {
        let initial = initial.clamp(1, max);
        Self {
            engine,
            executor,
            wrap_buf: vec![0; initial],
            unwrap_buf: vec![0; initial],
            max_buffer: max,
            inbound: BytesMut::new(),
            held: Vec::new(),
            finished: false,
            client,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    /// Plaintext bytes waiting for the handshake to finish.
    pub fn held_len(&self) -> usize {
        self.held.iter().map(Bytes::len).sum()
    }

    /// Kick off the handshake once the transport is connected. A client
    /// emits its hello here; a server usually has nothing to send yet.
    /// Returns true if the handshake finished.
    pub fn begin(&mut self, out: &mut ChunkQueue) -> Result<bool> {
        self.drive(out)
    }

    /// Feed ciphertext from the socket. Decrypted bytes go to `plain`,
    /// handshake replies to `out`.
    pub fn receive(&mut self, ciphertext: &[u8], plain: &mut ChunkQueue, out: &mut ChunkQueue) -> Result<Progress> {
        self.inbound.extend_from_slice(ciphertext);
        let mut progress = Progress::default();

        loop {
            progress.finished |= self.drive(out)?;

            let result = self.unwrap_once()?;
            self.inbound.advance(result.consumed);

            if result.handshake == HandshakeStatus::Finished {
                progress.finished |= self.complete_handshake(out)?;
            }

            if result.produced > 0 {
                if !self.finished || result.status != EngineStatus::Ok {
                    return Err(Error::tls("application data received before handshake completion"));
                }
                plain.push(Bytes::copy_from_slice(&self.unwrap_buf[..result.produced]));
            }

            match result.status {
                EngineStatus::Closed => {
                    progress.peer_closed = true;
                    break;
                }
                _ if !result.made_progress() => break,
                _ => {}
            }
        }

        progress.finished |= self.drive(out)?;
        Ok(progress)
    }

    /// Encrypt application bytes into `out`, or hold them until the
    /// handshake has finished.
    pub fn send(&mut self, plaintext: Bytes, out: &mut ChunkQueue) -> Result<()> {
        if plaintext.is_empty() {
            return Ok(());
        }
        if !self.finished {
            self.held.push(plaintext);
            return Ok(());
        }

        let mut offset = 0;
        while offset < plaintext.len() {
            let result = self.wrap_once(&plaintext[offset..], out)?;
            if result.status == EngineStatus::Closed {
                return Err(Error::Closed);
            }
            if !result.made_progress() {
                return Err(Error::tls("engine made no progress wrapping application data"));
            }
            offset += result.consumed;
        }

        self.drive(out)?;
        Ok(())
    }

    /// Emit the close notification into `out`.
    pub fn close_outbound(&mut self, out: &mut ChunkQueue) -> Result<()> {
        self.engine.close_outbound();
        loop {
            let result = self.wrap_once(&[], out)?;
            if result.produced == 0 || result.status == EngineStatus::Closed {
                return Ok(());
            }
        }
    }

    /// Run tasks and emit records for as long as the engine asks for it.
    /// Returns true if the handshake finished along the way.
    fn drive(&mut self, out: &mut ChunkQueue) -> Result<bool> {
        let mut finished = false;
        loop {
            match self.engine.handshake_status() {
                HandshakeStatus::NeedTask => {
                    if !self.run_tasks() {
                        return Err(Error::tls("engine requested a task but supplied none"));
                    }
                }
                HandshakeStatus::NeedWrap => {
                    let result = self.wrap_once(&[], out)?;
                    if result.handshake == HandshakeStatus::Finished {
                        finished |= self.complete_handshake(out)?;
                    }
                    if result.produced == 0 {
                        return Ok(finished);
                    }
                }
                _ => return Ok(finished),
            }
        }
    }

    fn run_tasks(&mut self) -> bool {
        let mut ran = false;
        while let Some(task) = self.engine.delegated_task() {
            self.executor.execute(task);
            ran = true;
        }
        ran
    }

    /// One `wrap`, growing the scratch buffer on overflow.
    fn wrap_once(&mut self, src: &[u8], out: &mut ChunkQueue) -> Result<EngineResult> {
        loop {
            let result = self.engine.wrap(src, &mut self.wrap_buf)?;
            if result.status == EngineStatus::BufferOverflow {
                grow(&mut self.wrap_buf, self.max_buffer)?;
                continue;
            }
            if result.produced > 0 {
                out.push(Bytes::copy_from_slice(&self.wrap_buf[..result.produced]));
            }
            if result.handshake == HandshakeStatus::NeedTask {
                self.run_tasks();
            }
            return Ok(result);
        }
    }

    /// One `unwrap` of the pending inbound bytes, growing the scratch
    /// buffer on overflow.
    fn unwrap_once(&mut self) -> Result<EngineResult> {
        loop {
            let result = self.engine.unwrap(&self.inbound, &mut self.unwrap_buf)?;
            if result.status == EngineStatus::BufferOverflow {
                grow(&mut self.unwrap_buf, self.max_buffer)?;
                continue;
            }
            if result.handshake == HandshakeStatus::NeedTask {
                self.run_tasks();
            }
            return Ok(result);
        }
    }

    /// Mark the handshake done and release held plaintext. Returns false if
    /// it was already done.
    fn complete_handshake(&mut self, out: &mut ChunkQueue) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        self.finished = true;
        for chunk in std::mem::take(&mut self.held) {
            self.send(chunk, out)?;
        }
        Ok(true)
    }
}

/// Double `buf`, failing once `max` would be exceeded.
fn grow(buf: &mut Vec<u8>, max: usize) -> Result<()> {
    let next = buf.len().saturating_mul(2);
    if buf.len() >= max {
        return Err(Error::TlsBufferLimit(max));
    }
    buf.resize(next.min(max), 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::engine::testing::{client_config, server_config};
    use crate::connection::engine::{InlineExecutor, RustlsEngine, Task};
    use crate::queue::join;
    use rustls::pki_types::ServerName;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted engine with a three-step handshake:
    /// wrap "HELLO" -> unwrap "WELCOME" -> task -> wrap "DONE" (Finished).
    /// Afterwards records are the plaintext wrapped in brackets.
    struct ScriptedEngine {
        state: HandshakeStatus,
        after_task: bool,
        tasks_run: Arc<AtomicUsize>,
        /// Minimum `dst` size accepted for application records.
        min_record: usize,
        closing: bool,
    }

    impl ScriptedEngine {
        fn new(tasks_run: Arc<AtomicUsize>) -> Self {
            Self {
                state: HandshakeStatus::NeedWrap,
                after_task: false,
                tasks_run,
                min_record: 0,
                closing: false,
            }
        }

        fn result(status: EngineStatus, handshake: HandshakeStatus, consumed: usize, produced: usize) -> Result<EngineResult> {
            Ok(EngineResult {
                status,
                handshake,
                consumed,
                produced,
            })
        }

        fn emit(dst: &mut [u8], bytes: &[u8]) -> Option<usize> {
            if dst.len() < bytes.len() {
                return None;
            }
            dst[..bytes.len()].copy_from_slice(bytes);
            Some(bytes.len())
        }
    }

    impl HandshakeEngine for ScriptedEngine {
        fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
            use EngineStatus::*;
            use HandshakeStatus::*;

            if self.closing {
                self.closing = false;
                let n = Self::emit(dst, b"BYE").unwrap();
                return Self::result(Closed, NotHandshaking, 0, n);
            }
            match self.state {
                NeedWrap if !self.after_task => {
                    let Some(n) = Self::emit(dst, b"HELLO") else {
                        return Self::result(BufferOverflow, NeedWrap, 0, 0);
                    };
                    self.state = NeedUnwrap;
                    Self::result(Ok, NeedUnwrap, 0, n)
                }
                NeedWrap => {
                    let Some(n) = Self::emit(dst, b"DONE") else {
                        return Self::result(BufferOverflow, NeedWrap, 0, 0);
                    };
                    self.state = NotHandshaking;
                    Self::result(Ok, Finished, 0, n)
                }
                NotHandshaking if !src.is_empty() => {
                    let record = [b"[", src, b"]"].concat();
                    if dst.len() < record.len().max(self.min_record) {
                        return Self::result(BufferOverflow, NotHandshaking, 0, 0);
                    }
                    dst[..record.len()].copy_from_slice(&record);
                    Self::result(Ok, NotHandshaking, src.len(), record.len())
                }
                state => Self::result(Ok, state, 0, 0),
            }
        }

        fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
            use EngineStatus::*;
            use HandshakeStatus::*;

            match self.state {
                NeedUnwrap => {
                    if src.len() < 7 {
                        return Self::result(BufferUnderflow, NeedUnwrap, 0, 0);
                    }
                    if &src[..7] != b"WELCOME" {
                        return Err(Error::tls("unexpected handshake message"));
                    }
                    self.state = NeedTask;
                    Self::result(Ok, NeedTask, 7, 0)
                }
                NotHandshaking if !src.is_empty() => {
                    let n = src.len().min(dst.len());
                    dst[..n].copy_from_slice(&src[..n]);
                    Self::result(Ok, NotHandshaking, n, n)
                }
                state => Self::result(BufferUnderflow, state, 0, 0),
            }
        }

        fn handshake_status(&self) -> HandshakeStatus {
            self.state
        }

        fn delegated_task(&mut self) -> Option<Task> {
            if self.state != HandshakeStatus::NeedTask {
                return None;
            }
            self.state = HandshakeStatus::NeedWrap;
            self.after_task = true;
            let counter = Arc::clone(&self.tasks_run);
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn close_outbound(&mut self) {
            self.closing = true;
        }
    }

    fn scripted(initial: usize, max: usize) -> (SecureSession, Arc<AtomicUsize>) {
        let tasks = Arc::new(AtomicUsize::new(0));
        let engine = ScriptedEngine::new(Arc::clone(&tasks));
        let session = SecureSession::with_buffer_sizes(Box::new(engine), Arc::new(InlineExecutor), true, initial, max);
        (session, tasks)
    }

    fn drain(queue: &mut ChunkQueue) -> Vec<u8> {
        join(queue.drain_all()).to_vec()
    }

    #[test]
    fn test_begin_wraps_without_application_data() {
        let (mut session, _) = scripted(64, 1024);
        let mut out = ChunkQueue::new();

        assert!(!session.begin(&mut out).unwrap());
        assert_eq!(drain(&mut out), b"HELLO");
        assert!(!session.is_finished());
    }

    #[test]
    fn test_handshake_gates_application_data() {
        let (mut session, tasks) = scripted(64, 1024);
        let mut out = ChunkQueue::new();
        let mut plain = ChunkQueue::new();

        session.begin(&mut out).unwrap();
        out.clear();

        // Written before the handshake: held, nothing leaves.
        session.send(Bytes::from_static(b"early"), &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(session.held_len(), 5);

        // Peer reply arrives in two pieces.
        let progress = session.receive(b"WEL", &mut plain, &mut out).unwrap();
        assert!(!progress.finished);
        assert!(plain.is_empty());

        let progress = session.receive(b"COME", &mut plain, &mut out).unwrap();
        assert!(progress.finished);
        assert!(session.is_finished());
        assert_eq!(tasks.load(Ordering::SeqCst), 1);
        assert!(plain.is_empty());

        // Handshake finish first, then the held plaintext.
        assert_eq!(drain(&mut out), b"DONE[early]");
        assert_eq!(session.held_len(), 0);

        session.receive(b"pong", &mut plain, &mut out).unwrap();
        assert_eq!(drain(&mut plain), b"pong");
    }

    #[test]
    fn test_wrap_buffer_doubles_on_overflow() {
        let tasks = Arc::new(AtomicUsize::new(0));
        let mut engine = ScriptedEngine::new(Arc::clone(&tasks));
        engine.min_record = 100;
        let mut session = SecureSession::with_buffer_sizes(Box::new(engine), Arc::new(InlineExecutor), true, 16, 1024);

        let mut out = ChunkQueue::new();
        let mut plain = ChunkQueue::new();
        session.begin(&mut out).unwrap();
        session.receive(b"WELCOME", &mut plain, &mut out).unwrap();
        out.clear();

        session.send(Bytes::from_static(b"payload"), &mut out).unwrap();
        assert_eq!(drain(&mut out), b"[payload]");
        assert_eq!(session.wrap_buf.len(), 128);
    }

    #[test]
    fn test_wrap_buffer_growth_is_bounded() {
        let tasks = Arc::new(AtomicUsize::new(0));
        let mut engine = ScriptedEngine::new(Arc::clone(&tasks));
        engine.min_record = 10_000;
        let mut session = SecureSession::with_buffer_sizes(Box::new(engine), Arc::new(InlineExecutor), true, 16, 64);

        let mut out = ChunkQueue::new();
        let mut plain = ChunkQueue::new();
        session.begin(&mut out).unwrap();
        session.receive(b"WELCOME", &mut plain, &mut out).unwrap();

        let err = session.send(Bytes::from_static(b"x"), &mut out).unwrap_err();
        assert!(matches!(err, Error::TlsBufferLimit(64)));
    }

    #[test]
    fn test_malformed_handshake_never_reaches_plaintext() {
        let (mut session, _) = scripted(64, 1024);
        let mut out = ChunkQueue::new();
        let mut plain = ChunkQueue::new();
        session.begin(&mut out).unwrap();

        let err = session.receive(b"GARBAGE", &mut plain, &mut out).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(plain.is_empty());
        assert!(!session.is_finished());
    }

    #[test]
    fn test_close_outbound_emits_notification() {
        let (mut session, _) = scripted(64, 1024);
        let mut out = ChunkQueue::new();
        session.close_outbound(&mut out).unwrap();
        assert_eq!(drain(&mut out), b"BYE");
    }

    #[test]
    fn test_rustls_sessions_exchange_data() {
        let name = ServerName::try_from("localhost").unwrap().to_owned();
        let client_engine = RustlsEngine::client(client_config(), name).unwrap();
        let server_engine = RustlsEngine::server(server_config()).unwrap();
        let mut client = SecureSession::new(Box::new(client_engine), Arc::new(InlineExecutor), true);
        let mut server = SecureSession::new(Box::new(server_engine), Arc::new(InlineExecutor), false);

        let mut to_server = ChunkQueue::new();
        let mut to_client = ChunkQueue::new();
        let mut client_plain = ChunkQueue::new();
        let mut server_plain = ChunkQueue::new();

        client.send(Bytes::from_static(b"ping"), &mut to_server).unwrap();
        client.begin(&mut to_server).unwrap();
        assert!(server.begin(&mut to_client).is_ok());

        let mut client_opened = 0;
        let mut server_opened = 0;
        for _ in 0..8 {
            let records = join(to_server.drain_all());
            if server.receive(&records, &mut server_plain, &mut to_client).unwrap().finished {
                server_opened += 1;
            }
            let records = join(to_client.drain_all());
            if client.receive(&records, &mut client_plain, &mut to_server).unwrap().finished {
                client_opened += 1;
            }
        }

        assert_eq!(client_opened, 1);
        assert_eq!(server_opened, 1);
        assert_eq!(drain(&mut server_plain), b"ping");

        server.send(Bytes::from_static(b"pong"), &mut to_client).unwrap();
        let records = join(to_client.drain_all());
        client.receive(&records, &mut client_plain, &mut to_server).unwrap();
        assert_eq!(drain(&mut client_plain), b"pong");

        // Close notify is seen by the peer as a clean close.
        client.close_outbound(&mut to_server).unwrap();
        let records = join(to_server.drain_all());
        let progress = server.receive(&records, &mut server_plain, &mut to_client).unwrap();
        assert!(progress.peer_closed);
    }
}
