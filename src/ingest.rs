//! Push ingest listener: accepts finished keys over TCP
//!
//! One exchange per connection: the producer sends a single push command,
//! the listener answers once and closes. Concurrent exchanges are capped by a
//! semaphore; connections beyond the cap are answered with `ERR:BUSY`.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use crate::config::ControllerConfig;
use crate::custodian::KeyCustodian;
use crate::{QkdNetError, Result};

/// How long a producer may take to deliver its payload
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. while out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Default client-side timeout for a push exchange
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResponse {
    Ack { n_bits: usize },
    BadFormat,
    Exception,
    Busy,
}

impl PushResponse {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Some(n) = text.strip_prefix("ACK:OK:bits=") {
            let n_bits = n
                .parse()
                .map_err(|_| QkdNetError::Protocol(format!("bad ack {:?}", text)))?;
            return Ok(PushResponse::Ack { n_bits });
        }
        match text {
            "ERR:BAD_FORMAT" => Ok(PushResponse::BadFormat),
            "ERR:EXCEPTION" => Ok(PushResponse::Exception),
            "ERR:BUSY" => Ok(PushResponse::Busy),
            _ => Err(QkdNetError::Protocol(format!("unexpected push response {:?}", text))),
        }
    }
}

impl fmt::Display for PushResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushResponse::Ack { n_bits } => write!(f, "ACK:OK:bits={}", n_bits),
            PushResponse::BadFormat => f.write_str("ERR:BAD_FORMAT"),
            PushResponse::Exception => f.write_str("ERR:EXCEPTION"),
            PushResponse::Busy => f.write_str("ERR:BUSY"),
        }
    }
}

/// Accepts key pushes and hands them to the custodian
pub struct PushIngestListener {
    custodian: KeyCustodian,
    config: ControllerConfig,
    permits: Arc<Semaphore>,
}

impl PushIngestListener {
    pub fn new(custodian: KeyCustodian, config: ControllerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_pushes));
        Self {
            custodian,
            config,
            permits,
        }
    }

    /// Bind the configured address and serve forever
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.push_listen_addr)
            .await
            .map_err(|e| QkdNetError::Transport(format!("Failed to bind {}: {}", self.config.push_listen_addr, e)))?;
        self.serve(listener).await
    }

    /// Serve pushes on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("Listening for key pushes on {}", listener.local_addr()?);

        let listener = &listener;
        loop {
            let (stream, addr) = accept_with_backoff(move || listener.accept()).await;

            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    log::warn!("Push capacity reached, rejecting {}", addr);
                    tokio::spawn(reject_busy(stream));
                    continue;
                }
            };

            let custodian = self.custodian.clone();
            let max_payload = self.config.max_push_payload;
            tokio::spawn(async move {
                if let Err(e) = handle_push(stream, addr, custodian, max_payload).await {
                    log::error!("Push from {} failed: {}", addr, e);
                }
                drop(permit);
            });
        }
    }
}

/// Retry `accept` until it yields a connection, pausing after each failure
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                log::error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn reject_busy(mut stream: TcpStream) {
    // Drain the command first; closing with unread data would reset the connection
    let mut discard = [0u8; 1024];
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut discard)).await;

    if let Err(e) = stream.write_all(PushResponse::Busy.to_string().as_bytes()).await {
        log::debug!("Failed to send busy reply: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// Read one payload, ingest it and answer
async fn handle_push(
    mut stream: TcpStream,
    addr: SocketAddr,
    custodian: KeyCustodian,
    max_payload: usize,
) -> Result<()> {
    let response = match read_payload(&mut stream, max_payload).await {
        Ok(payload) => match custodian.ingest(&payload).await {
            Ok(ack) => PushResponse::Ack { n_bits: ack.n_bits },
            Err(QkdNetError::Format(reason)) => {
                log::warn!("Rejected push from {} ({}): {:.120}", addr, reason, payload);
                PushResponse::BadFormat
            }
            Err(e) => {
                log::error!("Ingest from {} failed: {}", addr, e);
                PushResponse::Exception
            }
        },
        Err(e) => {
            log::error!("Failed to read push from {}: {}", addr, e);
            PushResponse::Exception
        }
    };

    stream.write_all(response.to_string().as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// A single read, as the producer sends its command in one write
async fn read_payload(stream: &mut TcpStream, max_payload: usize) -> Result<String> {
    let mut buf = vec![0u8; max_payload];
    let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| QkdNetError::Timeout("no push payload received".into()))??;
    buf.truncate(n);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Push `payload` to the listener at `addr` and return its response
pub async fn push_key(addr: &str, payload: &str, timeout: Duration) -> Result<PushResponse> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| QkdNetError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        PushResponse::parse(&String::from_utf8_lossy(&response))
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| QkdNetError::Timeout(format!("push to {} timed out", addr)))??;
    log::info!("Push to {} answered {}", addr, response);
    Ok(response)
}
