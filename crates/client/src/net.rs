use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::client_async;
use url::Url;

use hail_common::config::ClientConfig;
use hail_common::ids::new_message_id;
use hail_protocol::{envelope, ActorKind, ClientHello, Envelope, ServerError, ServerWelcome};

pub enum OutgoingMessage {
    Envelope(Envelope),
    Close,
}

pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    pub incoming: mpsc::UnboundedReceiver<Envelope>,
    pub welcome: ServerWelcome,
}

pub async fn connect(
    config: &ClientConfig,
    identifier: &str,
    kind: ActorKind,
) -> anyhow::Result<Connection> {
    const CONNECT_TIMEOUT_SECS: u64 = 10;

    let url = Url::parse(&config.relay_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("invalid relay_url"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("invalid relay_url"))?;
    let addr = format!("{host}:{port}");

    let tcp = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect timeout ({CONNECT_TIMEOUT_SECS}s)"))??;

    let (ws_stream, _) = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        client_async(config.relay_url.clone(), tcp),
    )
    .await
    .map_err(|_| anyhow::anyhow!("websocket handshake timeout ({CONNECT_TIMEOUT_SECS}s)"))??;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let hello_env = timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), ws_read.next())
        .await
        .map_err(|_| anyhow::anyhow!("timeout waiting for server:hello"))?
        .ok_or_else(|| anyhow::anyhow!("no server hello"))??;
    let hello_env: Envelope = serde_json::from_str(hello_env.to_text()?)?;
    if hello_env.message_type != "server:hello" {
        anyhow::bail!("expected server:hello")
    }

    let hello = ClientHello {
        identifier: identifier.to_string(),
        kind,
    };
    let hello_env = envelope("client:hello", &new_message_id(), now_ms(), &hello)?;
    ws_write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            serde_json::to_string(&hello_env)?,
        ))
        .await?;

    let welcome_env = timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), ws_read.next())
        .await
        .map_err(|_| anyhow::anyhow!("timeout waiting for server:welcome"))?
        .ok_or_else(|| anyhow::anyhow!("no server welcome"))??;
    let welcome_env: Envelope = serde_json::from_str(welcome_env.to_text()?)?;
    if welcome_env.message_type == "server:error" {
        let err: ServerError = serde_json::from_value(welcome_env.payload)?;
        anyhow::bail!("registration rejected: {} ({})", err.message, err.code)
    }
    if welcome_env.message_type != "server:welcome" {
        anyhow::bail!("expected server:welcome")
    }
    let welcome: ServerWelcome = serde_json::from_value(welcome_env.payload)?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut ws_write_task = ws_write;
    tokio::spawn(async move {
        use std::borrow::Cow;
        use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
        while let Some(msg) = out_rx.recv().await {
            match msg {
                OutgoingMessage::Envelope(env) => {
                    if let Ok(text) = serde_json::to_string(&env) {
                        let _ = ws_write_task
                            .send(tokio_tungstenite::tungstenite::Message::Text(text))
                            .await;
                    }
                }
                OutgoingMessage::Close => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed("client exit"),
                    };
                    let _ = ws_write_task
                        .send(tokio_tungstenite::tungstenite::Message::Close(Some(frame)))
                        .await;
                    break;
                }
            }
        }
    });

    let mut ws_read_task = ws_read;
    tokio::spawn(async move {
        while let Some(msg) = ws_read_task.next().await {
            if let Ok(msg) = msg {
                if msg.is_text() {
                    if let Ok(env) = serde_json::from_str::<Envelope>(msg.to_text().unwrap_or("")) {
                        let _ = in_tx.send(env);
                    }
                }
            }
        }
    });

    Ok(Connection {
        outgoing: out_tx,
        incoming: in_rx,
        welcome,
    })
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
