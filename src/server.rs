//! Production TLS listener
//!
//! Every handshake goes through [`ChallengeResponder`], so the CA's
//! TLS-ALPN-01 probes and ordinary clients share one port. Validation
//! connections are closed as soon as the handshake completes. Ordinary
//! connections are handed to a [`ConnectionHandler`].
//!
//! The ClientHello is read before a configuration is chosen. A client whose
//! ALPN offer shares nothing with ours completes the handshake without ALPN
//! and gets the production certificate.

use crate::error::Result;
use async_trait::async_trait;
use certpilot_acme::{CancelSignal, ChallengeResponder, SharedCertState};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

/// Default limit for a client to complete the TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest request or header line [`StaticResponse`] reads
const MAX_REQUEST_LINE: u64 = 8 * 1024;

/// Most header lines [`StaticResponse`] reads before giving up
const MAX_REQUEST_LINES: usize = 100;

/// Serves application traffic on an established TLS connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TlsStream<TcpStream>, peer: SocketAddr) -> std::io::Result<()>;
}

/// Answers every HTTP/1.1 request with one fixed plain-text body
#[derive(Debug, Clone)]
pub struct StaticResponse {
    body: String,
}

impl StaticResponse {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl ConnectionHandler for StaticResponse {
    async fn handle(&self, stream: TlsStream<TcpStream>, _peer: SocketAddr) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);

        // Drain the request head; the body is ignored
        let mut line = String::new();
        let mut complete = false;
        for _ in 0..MAX_REQUEST_LINES {
            line.clear();
            let read = (&mut reader)
                .take(MAX_REQUEST_LINE)
                .read_line(&mut line)
                .await?;
            if read == 0 || line == "\r\n" || line == "\n" {
                complete = true;
                break;
            }
            if !line.ends_with('\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request line too long",
                ));
            }
        }
        if !complete {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "too many request header lines",
            ));
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            self.body.len(),
            self.body
        );
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

/// Picks the rustls configuration for a connection from its ClientHello
#[derive(Clone)]
struct Handshaker {
    responder: Arc<ChallengeResponder>,
    /// Offers our full ALPN list
    negotiating: Arc<ServerConfig>,
    /// Same resolver, no ALPN
    plain: Arc<ServerConfig>,
    timeout: Duration,
}

impl Handshaker {
    fn new(responder: Arc<ChallengeResponder>) -> Result<Self> {
        let negotiating = responder.clone().server_config()?;
        let mut plain = negotiating.clone();
        plain.alpn_protocols.clear();

        Ok(Self {
            responder,
            negotiating: Arc::new(negotiating),
            plain: Arc::new(plain),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    fn config_for(&self, offered: &[&[u8]]) -> Arc<ServerConfig> {
        if self.responder.negotiate(offered).is_some() {
            self.negotiating.clone()
        } else {
            self.plain.clone()
        }
    }

    async fn accept(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), tcp).await?;
            let config = {
                let hello = start.client_hello();
                let offered: Vec<&[u8]> = hello
                    .alpn()
                    .map(|protocols| protocols.collect())
                    .unwrap_or_default();
                self.config_for(&offered)
            };
            start.into_stream(config).await
        };

        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
    }
}

/// TLS listener wired to the shared certificate state
pub struct TlsServer {
    listener: TcpListener,
    handshaker: Handshaker,
    shared: Arc<SharedCertState>,
}

impl TlsServer {
    /// Bind `addr` and build the rustls configuration from the responder
    pub async fn bind(
        addr: &str,
        responder: Arc<ChallengeResponder>,
        shared: Arc<SharedCertState>,
    ) -> Result<Self> {
        let handshaker = Handshaker::new(responder)?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "TLS listener bound");

        Ok(Self {
            listener,
            handshaker,
            shared,
        })
    }

    /// Limit how long a client may take to complete the handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshaker.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn serve<H: ConnectionHandler>(self, handler: H, cancel: CancelSignal) -> Result<()> {
        let handler = Arc::new(handler);

        loop {
            let (tcp, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "Accept failed");
                        continue;
                    }
                },
            };

            let handshaker = self.handshaker.clone();
            let shared = self.shared.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(handshaker, shared, handler, tcp, peer).await {
                    debug!(peer = %peer, error = %err, "Connection ended with error");
                }
            });
        }

        info!("TLS listener stopped");
        Ok(())
    }
}

async fn serve_connection<H: ConnectionHandler>(
    handshaker: Handshaker,
    shared: Arc<SharedCertState>,
    handler: Arc<H>,
    tcp: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let mut stream = handshaker.accept(tcp).await?;
    let (_, connection) = stream.get_ref();

    if ChallengeResponder::is_validation_connection(connection.alpn_protocol()) {
        info!(
            peer = %peer,
            server_name = connection.server_name().unwrap_or("<none>"),
            "Answered TLS-ALPN-01 validation handshake"
        );
        return stream.shutdown().await;
    }

    // A production handshake succeeded, so a newer certificate is in use
    if shared.has_superseded()
        && let Err(err) = shared.load_production_certificate()
    {
        warn!(error = %err, "Could not confirm production certificate");
    }

    handler.handle(stream, peer).await
}
