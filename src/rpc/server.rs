use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::lease::LeaseManager;
use crate::rpc::protocol::{Request, Response, RpcError, codec, decode, encode};
use crate::stopset::StopSet;

/// Serves lease requests until cancelled, one task per connection
pub struct LeaderServer<S: StopSet> {
    manager: Arc<LeaseManager<S>>,
}

impl<S: StopSet> LeaderServer<S> {
    pub fn new(manager: Arc<LeaseManager<S>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<LeaseManager<S>> {
        &self.manager
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))
    }

    /// Accept connections until `cancel` fires
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(
            listen = %local,
            ranges = self.manager.range_count(),
            lease_timeout_s = self.manager.lease_timeout().as_secs_f64(),
            "leader listening"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let manager = self.manager.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(manager, stream, peer, cancel).await {
                            tracing::warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        self.manager.shutdown();
        tracing::info!(stats = ?self.manager.stats(), "leader stopped");
        Ok(())
    }
}

async fn handle_connection<S: StopSet>(
    manager: Arc<LeaseManager<S>>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), RpcError> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, codec());
    tracing::debug!(%peer, "monitor connected");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let request: Request = decode(&frame?)?;
        let response = dispatch(&manager, request);
        framed.send(encode(&response)?).await?;
    }

    tracing::debug!(%peer, "monitor disconnected");
    Ok(())
}

/// Apply one request to the lease manager
pub fn dispatch<S: StopSet>(manager: &Arc<LeaseManager<S>>, request: Request) -> Response {
    let result = match request {
        Request::AcquireRange { agent_id } => manager.acquire_range(&agent_id).map(Response::Granted),
        Request::SubmitResults(submission) => manager
            .submit_results(&submission)
            .map(|()| Response::Submitted),
    };
    result.unwrap_or_else(Response::Rejected)
}
