//! nbio: line-echo demo server
//!
//! Accepts connections on the configured address, hands them to the
//! dispatcher pool and echoes every `\r\n` terminated line back. Sending
//! `QUIT` closes the connection gracefully.

use nbio::{Config, Connection, DispatcherPool, Handler, Result, TlsServer};
use std::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Longest line accepted before the connection is dropped.
const MAX_LINE: usize = 8 * 1024;

struct LineEcho;

impl Handler for LineEcho {
    fn on_connect(&mut self, conn: &Connection) -> Result<()> {
        debug!(conn_id = conn.id(), peer = ?conn.peer_addr(), "Client connected");
        Ok(())
    }

    fn on_data(&mut self, conn: &Connection) -> Result<()> {
        loop {
            let line = conn.read_string_by_delimiter_max("\r\n", MAX_LINE)?;
            if line == "QUIT" {
                conn.close();
                return Ok(());
            }
            conn.write_str(&line)?;
            conn.write_str("\r\n")?;
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let tls = match &config.tls {
        Some(files) => Some(TlsServer::from_pem_files(&files.cert, &files.key)?),
        None => None,
    };

    info!(
        listen = %config.listen,
        dispatchers = config.dispatcher_count(),
        tls = tls.is_some(),
        idle_timeout = ?config.dispatcher.idle_timeout,
        "Starting nbio echo server"
    );

    let pool = DispatcherPool::start(&config)?;
    let listener = TcpListener::bind(&config.listen)?;
    let factory = |_: &Connection| LineEcho;

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = pool.accept(stream, &factory, tls.as_ref()) {
            warn!(error = %e, "Failed to register connection");
        }
    }

    pool.shutdown();
    Ok(())
}
