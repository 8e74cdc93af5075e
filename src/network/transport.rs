use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

use crate::core::protocol::{Envelope, Response};
use crate::utils::{PdnError, Result};

/// Request/response delivery to a peer. Implementations bound every call
/// in time and report an unreachable peer as an error, never a hang.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<Response>;
}

/// Receives inbound envelopes.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, envelope: Envelope) -> Response;
}

/// One connection per request, frames are a u32 length followed by JSON.
pub struct TcpTransport {
    request_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(request_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            request_timeout,
            max_frame_bytes,
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            PdnError::PeerUnreachable(format!("Failed to connect to {}: {}", addr, e))
        })?;

        debug!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PdnError::IoError(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", addr);
        Ok(listener)
    }

    pub async fn send_data(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| PdnError::MessageTooLarge(data.len()))?;
        stream.write_u32(len).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn receive_data(stream: &mut TcpStream, max_size: usize) -> Result<Vec<u8>> {
        let len = stream.read_u32().await? as usize;

        if len > max_size {
            return Err(PdnError::MessageTooLarge(len));
        }

        let mut buffer = vec![0u8; len];
        stream.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn exchange(&self, to: SocketAddr, envelope: &Envelope) -> Result<Response> {
        let mut stream = Self::connect(to).await?;
        let data = serde_json::to_vec(envelope)?;
        if data.len() > self.max_frame_bytes {
            return Err(PdnError::MessageTooLarge(data.len()));
        }

        Self::send_data(&mut stream, &data).await?;
        let reply = Self::receive_data(&mut stream, self.max_frame_bytes).await?;
        serde_json::from_slice(&reply)
            .map_err(|e| PdnError::InvalidResponse(format!("from {}: {}", to, e)))
    }

    /// Accept connections until the listener fails for good. Each connection
    /// gets its own task; `limit` caps requests handled at once.
    pub async fn serve(
        listener: TcpListener,
        dispatcher: Arc<dyn Dispatcher>,
        max_frame_bytes: usize,
        limit: Arc<Semaphore>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from: {}", addr);

                    let dispatcher = dispatcher.clone();
                    let limit = limit.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, dispatcher, max_frame_bytes, limit).await
                        {
                            warn!("Failed to handle connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        dispatcher: Arc<dyn Dispatcher>,
        max_frame_bytes: usize,
        limit: Arc<Semaphore>,
    ) -> Result<()> {
        loop {
            let data = match Self::receive_data(&mut stream, max_frame_bytes).await {
                Ok(data) => data,
                // Peer closed the connection after its last request.
                Err(PdnError::IoError(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            let response = match serde_json::from_slice::<Envelope>(&data) {
                Ok(envelope) => {
                    let _permit = limit
                        .acquire()
                        .await
                        .map_err(|e| PdnError::IoError(format!("request limiter closed: {}", e)))?;
                    dispatcher.dispatch(envelope).await
                }
                Err(e) => Response::Error(format!("malformed request: {}", e)),
            };

            let reply = serde_json::to_vec(&response)?;
            Self::send_data(&mut stream, &reply).await?;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: SocketAddr, envelope: Envelope) -> Result<Response> {
        match timeout(self.request_timeout, self.exchange(to, &envelope)).await {
            Ok(result) => result,
            Err(_) => Err(PdnError::Timeout(to.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::Request;
    use crate::network::dht::DhtRequest;

    struct Echo;

    #[async_trait]
    impl Dispatcher for Echo {
        async fn dispatch(&self, envelope: Envelope) -> Response {
            Response::Error(envelope.request.kind().to_string())
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_over_tcp() {
        let listener = TcpTransport::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(TcpTransport::serve(
            listener,
            Arc::new(Echo),
            1024,
            Arc::new(Semaphore::new(4)),
        ));

        let transport = TcpTransport::new(Duration::from_secs(2), 1024);
        let response = transport
            .send(addr, Envelope::new(None, Request::Dht(DhtRequest::Ping)))
            .await
            .unwrap();
        assert!(matches!(response, Response::Error(kind) if kind == "dht"));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpTransport::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(2), 1024);
        let err = transport
            .send(addr, Envelope::new(None, Request::Dht(DhtRequest::Ping)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let transport = TcpTransport::new(Duration::from_secs(2), 16);
        let listener = TcpTransport::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let err = transport
            .send(addr, Envelope::new(None, Request::Dht(DhtRequest::Ping)))
            .await
            .unwrap_err();
        assert!(matches!(err, PdnError::MessageTooLarge(_)));

        // Keep the listener alive until the send finished.
        drop(listener);
    }
}
