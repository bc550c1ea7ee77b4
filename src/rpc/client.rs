use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::lease::{RangeGrant, Submission};
use crate::rpc::LeaseClient;
use crate::rpc::protocol::{Request, Response, RpcError, codec, decode, encode};

/// First reconnect delay
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Reconnect delay ceiling
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Leader client over one lazily opened TCP connection.
///
/// A broken connection is dropped and re-dialed on the next call. Requests are
/// never replayed automatically.
pub struct RpcLeaseClient {
    addr: String,
    connect_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RpcLeaseClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Dial with exponential backoff until the connect timeout runs out
    async fn connect(&self) -> Result<Connection, RpcError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(leader = %self.addr, attempt, "connected to leader");
                    return Ok(Framed::new(stream, codec()));
                }
                Ok(Err(e)) => {
                    tracing::debug!(leader = %self.addr, attempt, error = %e, "leader dial failed");
                }
                Err(_) => {}
            }

            if Instant::now() + backoff >= deadline {
                return Err(RpcError::ConnectTimeout {
                    addr: self.addr.clone(),
                    timeout: self.connect_timeout,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One request/response exchange
    pub async fn call(&self, request: &Request) -> Result<Response, RpcError> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let result = exchange(&mut conn, request).await;
        if result.is_ok() {
            *guard = Some(conn);
        }
        result
    }
}

async fn exchange(conn: &mut Connection, request: &Request) -> Result<Response, RpcError> {
    conn.send(encode(request)?).await?;
    match conn.next().await {
        Some(frame) => decode(&frame?),
        None => Err(RpcError::Closed),
    }
}

#[async_trait]
impl LeaseClient for RpcLeaseClient {
    async fn acquire_range(&self, agent_id: &str) -> Result<RangeGrant, RpcError> {
        let request = Request::AcquireRange {
            agent_id: agent_id.to_string(),
        };
        match self.call(&request).await? {
            Response::Granted(grant) => Ok(grant),
            Response::Rejected(e) => Err(RpcError::Remote(e)),
            other => Err(RpcError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    async fn submit_results(&self, submission: Submission) -> Result<(), RpcError> {
        match self.call(&Request::SubmitResults(submission)).await? {
            Response::Submitted => Ok(()),
            Response::Rejected(e) => Err(RpcError::Remote(e)),
            other => Err(RpcError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}
