//! One STOMP-over-WebSocket session: connect, handshake, subscribe.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use pairchat_proto::address::PairKey;
use pairchat_proto::stomp::{Command, Frame, HeartBeat, NegotiatedHeartBeat};

use super::{ConnectError, ConnectionConfig, Credential};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of the socket.
pub(super) type WsSink = SplitSink<WsStream, Message>;

/// Read half of the socket.
pub(super) type WsReader = SplitStream<WsStream>;

/// Subscription id used for the single topic subscription of a session.
pub(super) const SUBSCRIPTION_ID: &str = "sub-0";

/// A connected, subscribed session.
pub(super) struct StompLink {
    pub sink: WsSink,
    pub reader: WsReader,
    pub heartbeat: NegotiatedHeartBeat,
}

/// Connect to the endpoint, complete the STOMP handshake, and subscribe to
/// the pair's topic. Bounded by `config.connect_timeout` when set.
pub(super) async fn establish(
    config: &ConnectionConfig,
    pair: &PairKey,
    credential: &Credential,
) -> Result<StompLink, ConnectError> {
    let attempt = handshake(config, pair, credential);
    match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| ConnectError::Timeout)?,
        None => attempt.await,
    }
}

async fn handshake(
    config: &ConnectionConfig,
    pair: &PairKey,
    credential: &Credential,
) -> Result<StompLink, ConnectError> {
    let (ws, _response) = connect_async(config.endpoint.as_str())
        .await
        .map_err(map_ws_connect_error)?;
    let (mut sink, mut reader) = ws.split();

    let host = url::Url::parse(&config.endpoint)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let offered = HeartBeat::symmetric(config.heartbeat);
    let connect = Frame::new(Command::Connect)
        .with_header("accept-version", "1.2")
        .with_header("host", host)
        .with_header("heart-beat", offered.to_header())
        .with_header("Authorization", format!("Bearer {}", credential.token()));
    send_frame(&mut sink, &connect).await?;

    let connected = await_connected(&mut reader).await?;
    let granted = match connected.header("heart-beat") {
        Some(value) => HeartBeat::parse(value).map_err(|e| ConnectError::Protocol(e.to_string()))?,
        None => HeartBeat::default(),
    };
    let heartbeat = offered.negotiate(granted);

    let subscribe = Frame::new(Command::Subscribe)
        .with_header("id", SUBSCRIPTION_ID)
        .with_header("destination", pair.topic())
        .with_header("ack", "auto");
    send_frame(&mut sink, &subscribe).await?;

    tracing::info!(
        pair = %pair,
        outgoing_hb = ?heartbeat.outgoing,
        incoming_hb = ?heartbeat.incoming,
        "subscribed"
    );
    Ok(StompLink {
        sink,
        reader,
        heartbeat,
    })
}

/// Wait for the server's answer to `CONNECT`. Any `ERROR` frame at this
/// point is treated as a credential rejection.
async fn await_connected(reader: &mut WsReader) -> Result<Frame, ConnectError> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                Ok(None) => {}
                Ok(Some(frame)) => match frame.command {
                    Command::Connected => return Ok(frame),
                    Command::Error => {
                        let reason = frame.header("message").unwrap_or("rejected").to_string();
                        tracing::warn!(reason = %reason, "server rejected CONNECT");
                        return Err(ConnectError::Auth(reason));
                    }
                    other => {
                        return Err(ConnectError::Protocol(format!(
                            "unexpected {other} during handshake"
                        )));
                    }
                },
                Err(e) => return Err(ConnectError::Protocol(e.to_string())),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectError::Transport(
                    "connection closed during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
        }
    }
}

/// Encode and write one frame.
pub(super) async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), ConnectError> {
    sink.send(Message::Text(frame.encode().into()))
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))
}

/// Map a WebSocket connect error, telling credential rejections apart from
/// network failures.
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ConnectError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => classify_upgrade_status(response.status()),
        WsError::Url(e) => ConnectError::Transport(format!("invalid endpoint: {e}")),
        other => ConnectError::Transport(other.to_string()),
    }
}

fn classify_upgrade_status(status: StatusCode) -> ConnectError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ConnectError::Auth(format!("upgrade refused with HTTP {status}"))
    } else {
        ConnectError::Transport(format!("upgrade failed with HTTP {status}"))
    }
}
