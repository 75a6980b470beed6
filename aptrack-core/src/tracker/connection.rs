//! Transport setup and the outbound half of the handshake.

use crate::error::{Error, Result};
use crate::protocol::{self, ClientMessage, Connect, GetDataPackage};
use futures_util::{Sink, SinkExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Port Archipelago servers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 38281;

/// Open websocket to a game server.
pub type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Canonical `ws://` / `wss://` form of a user-supplied address.
///
/// Bare `host[:port]` gains `ws://`; a missing port becomes [`DEFAULT_PORT`].
pub fn normalize_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidAddress("address is empty".to_string()));
    }
    let with_scheme = match trimmed.split_once("://") {
        Some((_, rest)) if rest.trim_matches('/').is_empty() => {
            return Err(Error::InvalidAddress(format!("{}: missing host", trimmed)))
        }
        Some((scheme, _))
            if scheme.eq_ignore_ascii_case("ws") || scheme.eq_ignore_ascii_case("wss") =>
        {
            trimmed.to_string()
        }
        Some((scheme, _)) => {
            return Err(Error::InvalidAddress(format!(
                "unsupported scheme {:?} in {}",
                scheme, trimmed
            )))
        }
        None => format!("ws://{}", trimmed),
    };

    let uri: Uri = with_scheme
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", trimmed, e)))?;
    let scheme = uri
        .scheme_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::InvalidAddress(format!("{}: missing scheme", trimmed)))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidAddress(format!("{}: missing host", trimmed)))?;
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    if let Some((_, port)) = authority.rsplit_once(':') {
        if !port.ends_with(']') && port.parse::<u16>().is_err() {
            return Err(Error::InvalidAddress(format!("{}: bad port {:?}", trimmed, port)));
        }
    }
    let port = uri.port_u16().unwrap_or(DEFAULT_PORT);
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| *p != "/")
        .unwrap_or_default();

    Ok(format!("{}://{}:{}{}", scheme, host, port, path))
}

/// Stable client identifier for this machine and address.
pub fn client_uuid(address: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(address.as_bytes());
    hex::encode(hasher.finalize())
}

/// Websocket limits: room state and data packages can be many megabytes.
pub fn transport_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = None;
    config.max_frame_size = None;
    config
}

/// Open a websocket within `timeout`.
pub async fn connect(address: &str, timeout: Duration) -> Result<Transport> {
    let request = address.into_client_request()?;
    tracing::debug!(server = %address, timeout_secs = timeout.as_secs(), "Opening websocket");
    let connecting =
        tokio_tungstenite::connect_async_with_config(request, Some(transport_config()), false);
    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok((transport, _response))) => {
            tracing::info!(server = %address, "Websocket connected");
            Ok(transport)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Transport(format!(
            "connect timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Send one frame of commands.
pub async fn send<S>(sink: &mut S, messages: &[ClientMessage]) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = protocol::encode_frame(messages)?;
    sink.send(Message::Text(frame)).await?;
    Ok(())
}

/// Send `Connect`. Confirmation arrives later as `Connected`.
pub async fn handshake<S>(sink: &mut S, password: Option<&str>, uuid: &str) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let connect = Connect::tracker(password, uuid.to_string());
    send(sink, &[ClientMessage::Connect(connect)]).await
}

/// Ask for the data package of the games in play, or all games when unknown.
pub async fn request_catalog<S>(sink: &mut S, active_games: &BTreeSet<String>) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    send(sink, &[catalog_request(active_games)]).await
}

pub fn catalog_request(active_games: &BTreeSet<String>) -> ClientMessage {
    let games = if active_games.is_empty() {
        None
    } else {
        Some(active_games.iter().cloned().collect())
    };
    ClientMessage::GetDataPackage(GetDataPackage { games })
}
