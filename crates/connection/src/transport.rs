//! Transport seam between the connection manager and the wire.
//!
//! A [`Transport`] opens one full-duplex text channel per call. The manager
//! owns the resulting [`TransportLink`] exclusively; dropping the link closes
//! the channel.

use async_trait::async_trait;
use common::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

/// Per-address TCP connect timeout.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame from the server.
    Message(String),
    /// The server closed the channel cleanly.
    Closed(Option<String>),
    /// The channel broke (I/O error, stream ended without a close frame).
    Error(String),
}

/// Both directions of an open channel.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound text frames. Dropping the sender closes the channel.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Inbound events, terminated by `Closed` or `Error`.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens channels to a server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket transport over tokio-tungstenite with rustls.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the host and connect to the first reachable address,
    /// trying IPv4 addresses before IPv6 ones.
    async fn connect_tcp(url: &Url) -> Result<TcpStream> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Generic(format!("No port for scheme {}", url.scheme())))?;
        let addr_str = format!("{}:{}", host, port);

        let addrs: Vec<SocketAddr> = addr_str
            .to_socket_addrs()
            .map_err(|e| Error::ConnectionRefused(format!("DNS resolution failed: {}", e)))?
            .collect();

        let mut sorted_addrs: Vec<SocketAddr> =
            addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
        sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

        debug!("Resolved {} (IPv4 first): {:?}", addr_str, sorted_addrs);

        for addr in &sorted_addrs {
            match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!("TCP connected to {}", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
                Err(_) => debug!("TCP connect to {} timed out", addr),
            }
        }

        Err(Error::ConnectionRefused(format!(
            "All connection attempts to {} failed",
            addr_str
        )))
    }

    fn tls_connector() -> Result<Connector> {
        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Connector::Rustls(Arc::new(config)))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url_str: &str) -> Result<TransportLink> {
        let url = Url::parse(url_str)?;
        let tcp_stream = Self::connect_tcp(&url).await?;

        // Plain `ws://` URLs ignore the connector.
        let connector = if url.scheme() == "wss" {
            Some(Self::tls_connector()?)
        } else {
            None
        };

        let (ws_stream, response) =
            client_async_tls_with_config(url_str, tcp_stream, None, connector).await?;
        info!(
            "WebSocket handshake with {} complete, status: {:?}",
            url_str,
            response.status()
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Shuttle frames between the socket and the link channels until either side ends.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Message(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if inbound_tx.send(TransportEvent::Message(text)).is_err() {
                                break;
                            }
                        }
                        Err(_) => debug!("Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        info!("Received close frame: {:?}", frame);
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = inbound_tx.send(TransportEvent::Closed(reason));
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {:?}", e);
                        let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = inbound_tx.send(TransportEvent::Error("WebSocket stream ended".to_string()));
                        break;
                    }
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            let _ = inbound_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    None => {
                        // Link dropped by the manager
                        let close_frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnect".into(),
                        };
                        let _ = write.send(Message::Close(Some(close_frame))).await;
                        break;
                    }
                }
            }
        }
    }
}
