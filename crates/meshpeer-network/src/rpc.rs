//! Peer Relay Control over TCP
//!
//! One JSON object per line. Requests carry a `method` tag; replies are
//! `{"result": ...}`, `{"at_capacity": max}` or `{"error": "..."}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::{NetworkError, NetworkResult};
use crate::relay::{ForwardingSession, RelayControl, SessionToken};

/// Longest request or reply line accepted
pub const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RelayRequest {
    CanOfferForwarding,
    SetupForwarding { name: String, connection_type: String },
    ForwardingIsAlive { id: u64, token: SessionToken },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayReply {
    Result(serde_json::Value),
    AtCapacity(usize),
    Error(String),
}

impl RelayReply {
    fn from_result<T: Serialize>(result: NetworkResult<T>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => RelayReply::Result(value),
                Err(e) => RelayReply::Error(e.to_string()),
            },
            Err(NetworkError::RelayCapacity { max }) => RelayReply::AtCapacity(max),
            Err(e) => RelayReply::Error(e.to_string()),
        }
    }

    fn into_result<T: for<'de> Deserialize<'de>>(self) -> NetworkResult<T> {
        match self {
            RelayReply::Result(value) => Ok(serde_json::from_value(value)?),
            RelayReply::AtCapacity(max) => Err(NetworkError::RelayCapacity { max }),
            RelayReply::Error(e) => Err(NetworkError::Rpc(e)),
        }
    }
}

async fn dispatch(control: &dyn RelayControl, request: RelayRequest) -> RelayReply {
    match request {
        RelayRequest::CanOfferForwarding => RelayReply::from_result(control.can_offer_forwarding().await),
        RelayRequest::SetupForwarding { name, connection_type } => {
            RelayReply::from_result(control.setup_forwarding(&name, &connection_type).await)
        }
        RelayRequest::ForwardingIsAlive { id, token } => {
            RelayReply::from_result(control.forwarding_is_alive(id, &token).await)
        }
    }
}

/// Next newline-terminated line, at most [`MAX_LINE`] bytes. `None` at EOF.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> NetworkResult<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.take(MAX_LINE as u64 + 1).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE {
        return Err(NetworkError::Protocol(format!("line exceeds {} bytes", MAX_LINE)));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| NetworkError::Protocol("line is not UTF-8".into()))
}

async fn handle_connection(stream: TcpStream, control: Arc<dyn RelayControl>) -> NetworkResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(line) = read_line(&mut reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<RelayRequest>(&line) {
            Ok(request) => {
                debug!("Relay control request: {:?}", request);
                dispatch(control.as_ref(), request).await
            }
            Err(e) => RelayReply::Error(format!("bad request: {}", e)),
        };
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        write_half.write_all(&bytes).await?;
    }
    Ok(())
}

/// Bind `addr` and serve `control` on it. Returns the bound address and
/// the accept task.
pub async fn serve_relay_control(
    addr: SocketAddr,
    control: Arc<dyn RelayControl>,
) -> NetworkResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Relay control listening on {}", local);

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, control).await {
                            debug!("Relay control connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Relay control accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
    Ok((local, task))
}

/// Client for a remote peer's relay control endpoint
pub struct RpcRelayClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl RpcRelayClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, request: &RelayRequest) -> NetworkResult<T> {
        let exchange = async {
            let stream = TcpStream::connect(self.addr).await?;
            let (read_half, mut write_half) = stream.into_split();

            let mut bytes = serde_json::to_vec(request)?;
            bytes.push(b'\n');
            write_half.write_all(&bytes).await?;

            let mut reader = BufReader::new(read_half);
            let line = read_line(&mut reader)
                .await?
                .ok_or_else(|| NetworkError::Rpc("connection closed without reply".into()))?;
            let reply: RelayReply = serde_json::from_str(&line)?;
            Ok::<_, NetworkError>(reply)
        };

        let reply = timeout(self.timeout, exchange)
            .await
            .map_err(|_| NetworkError::TimeoutWithMessage(format!("relay control {}", self.addr)))??;
        reply.into_result()
    }
}

#[async_trait]
impl RelayControl for RpcRelayClient {
    async fn can_offer_forwarding(&self) -> NetworkResult<bool> {
        self.call(&RelayRequest::CanOfferForwarding).await
    }

    async fn setup_forwarding(&self, name: &str, connection_type: &str) -> NetworkResult<ForwardingSession> {
        self.call(&RelayRequest::SetupForwarding {
            name: name.to_string(),
            connection_type: connection_type.to_string(),
        })
        .await
    }

    async fn forwarding_is_alive(&self, id: u64, token: &SessionToken) -> NetworkResult<bool> {
        self.call(&RelayRequest::ForwardingIsAlive { id, token: *token }).await
    }
}
