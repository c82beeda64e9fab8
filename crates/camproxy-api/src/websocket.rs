//! NVR control-channel websocket.
//!
//! Opens `wss://<host>:<port>/camera/1.0/ws?token=<adoption token>` with the
//! device identity as client certificate, the `camera-mac` header, and the
//! `secure_transfer` subprotocol. The socket is split into an
//! [`NvrWriter`] and an [`NvrReader`] so the owner can `select!` on inbound
//! frames while sending from another branch.
//!
//! Reconnection is the owner's business; a dropped socket surfaces as
//! `None` or an error from [`NvrReader::next_message`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;
use crate::protocol::NvrMessage;

/// Default NVR control-channel port.
pub const DEFAULT_PORT: u16 = 7442;

/// Default bound on TCP connect, TLS handshake and upgrade together.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SUBPROTOCOL: &str = "secure_transfer";
const MAC_HEADER: &str = "camera-mac";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to open the control channel.
#[derive(Clone)]
pub struct NvrEndpoint {
    pub host: String,
    pub port: u16,
    pub token: SecretString,
    /// Bare uppercase hex MAC, sent as the `camera-mac` header.
    pub mac: String,
    pub tls: Arc<rustls::ClientConfig>,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for NvrEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvrEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mac", &self.mac)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl NvrEndpoint {
    /// The websocket URL, token included.
    pub fn url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&format!("wss://{}:{}/camera/1.0/ws", self.host, self.port))?;
        url.query_pairs_mut()
            .append_pair("token", self.token.expose_secret());
        Ok(url)
    }
}

/// Write half of an open control channel.
pub struct NvrWriter {
    sink: SplitSink<Socket, tungstenite::Message>,
}

/// Read half of an open control channel.
pub struct NvrReader {
    stream: SplitStream<Socket>,
}

/// Open the control channel.
pub async fn connect(endpoint: &NvrEndpoint) -> Result<(NvrWriter, NvrReader), Error> {
    let url = endpoint.url()?;
    tracing::info!(host = %endpoint.host, port = endpoint.port, "connecting to NVR");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri)
        .with_header(MAC_HEADER, endpoint.mac.clone())
        .with_sub_protocol(SUBPROTOCOL);

    let connector = Connector::Rustls(Arc::clone(&endpoint.tls));
    let handshake =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector));
    let (ws_stream, _response) = tokio::time::timeout(endpoint.connect_timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            timeout_ms: u64::try_from(endpoint.connect_timeout.as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("NVR control channel connected");

    let (sink, stream) = ws_stream.split();
    Ok((NvrWriter { sink }, NvrReader { stream }))
}

impl NvrWriter {
    pub async fn send(&mut self, message: &NvrMessage) -> Result<(), Error> {
        let json = serde_json::to_string(message).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;
        tracing::trace!(function = %message.function_name, id = message.message_id, "→ NVR");
        self.sink
            .send(tungstenite::Message::text(json))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    /// Send a close frame, ignoring errors.
    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}

impl NvrReader {
    /// Next decoded frame from the NVR.
    ///
    /// Returns `None` when the stream ended without a close frame and
    /// [`Error::WebSocketClosed`] when the NVR closed it. Undecodable frames
    /// are logged and skipped.
    pub async fn next_message(&mut self) -> Option<Result<NvrMessage, Error>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(Error::WebSocketConnect(e.to_string()))),
            };

            match frame {
                tungstenite::Message::Text(text) => {
                    if let Some(msg) = decode_frame(text.as_bytes()) {
                        return Some(Ok(msg));
                    }
                }
                tungstenite::Message::Binary(data) => {
                    if let Some(msg) = decode_frame(&data) {
                        return Some(Ok(msg));
                    }
                }
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                        (u16::from(cf.code), cf.reason.as_str().to_owned())
                    });
                    tracing::info!(code, reason = %reason, "NVR closed control channel");
                    return Some(Err(Error::WebSocketClosed { code, reason }));
                }
                tungstenite::Message::Ping(_) => {
                    // tungstenite queues the pong
                    tracing::trace!("NVR ping");
                }
                _ => {}
            }
        }
    }
}

fn decode_frame(bytes: &[u8]) -> Option<NvrMessage> {
    match serde_json::from_slice::<NvrMessage>(bytes) {
        Ok(msg) => {
            tracing::trace!(function = %msg.function_name, id = msg.message_id, "← NVR");
            Some(msg)
        }
        Err(e) => {
            tracing::debug!(error = %e, len = bytes.len(), "skipping undecodable NVR frame");
            None
        }
    }
}
