// Local presence IPC transport
// Framed JSON over the desktop client's socket (unix) or named pipe (windows)

use super::{Activity, Connection, PresenceConnector, PresenceError, PresenceSession};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const OP_HANDSHAKE: u32 = 0;
pub const OP_FRAME: u32 = 1;
pub const OP_CLOSE: u32 = 2;
pub const OP_PING: u32 = 3;
pub const OP_PONG: u32 = 4;

const PROTOCOL_VERSION: u32 = 1;
const MAX_FRAME_LEN: usize = 64 * 1024;
const PIPE_SLOTS: u8 = 10;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Frame layout: opcode (u32 LE), payload length (u32 LE), JSON payload
pub fn encode_frame(opcode: u32, payload: &Value) -> Vec<u8> {
    let body = payload.to_string().into_bytes();
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

pub async fn read_frame<R>(reader: &mut R) -> Result<(u32, Value), PresenceError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PresenceError::Protocol(format!("frame of {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let payload = serde_json::from_slice(&body)
        .map_err(|e| PresenceError::Protocol(format!("invalid JSON payload: {}", e)))?;
    Ok((opcode, payload))
}

async fn write_frame(writer: &SharedWriter, opcode: u32, payload: &Value) -> Result<(), PresenceError> {
    let frame = encode_frame(opcode, payload);
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Connects to the desktop client's local IPC endpoint
#[derive(Debug, Clone)]
pub struct DiscordIpc {
    client_id: String,
}

impl DiscordIpc {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl PresenceConnector for DiscordIpc {
    async fn connect(&self) -> Result<Connection, PresenceError> {
        let (reader, writer) = platform::open().await?;
        establish(&self.client_id, reader, writer).await
    }
}

/// Run the handshake over an open stream and start watching it
pub async fn establish<R, W>(client_id: &str, mut reader: R, writer: W) -> Result<Connection, PresenceError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
    write_frame(
        &writer,
        OP_HANDSHAKE,
        &json!({ "v": PROTOCOL_VERSION, "client_id": client_id }),
    )
    .await?;

    match read_frame(&mut reader).await? {
        (OP_FRAME, payload) if payload["evt"] == "READY" => {
            log::debug!(
                "Presence handshake accepted for {}",
                payload["data"]["user"]["username"].as_str().unwrap_or("unknown user")
            );
        }
        (OP_CLOSE, payload) => {
            let message = payload["message"].as_str().unwrap_or("closed").to_string();
            return Err(PresenceError::Handshake(message));
        }
        (opcode, _) => {
            return Err(PresenceError::Handshake(format!(
                "unexpected opcode {} before READY",
                opcode
            )));
        }
    }

    let (dropped_tx, dropped) = oneshot::channel();
    let watcher = tokio::spawn(watch(reader, writer.clone(), dropped_tx));

    Ok(Connection {
        session: Box::new(IpcSession {
            writer,
            watcher,
            pid: std::process::id(),
        }),
        dropped,
    })
}

/// Answers pings and reports the end of the stream
async fn watch<R>(mut reader: R, writer: SharedWriter, dropped: oneshot::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok((OP_PING, payload)) => {
                if write_frame(&writer, OP_PONG, &payload).await.is_err() {
                    break;
                }
            }
            Ok((OP_CLOSE, payload)) => {
                log::debug!("Presence service closed the session: {}", payload);
                break;
            }
            Ok((_, payload)) => {
                if payload["evt"] == "ERROR" {
                    log::warn!("Presence service error: {}", payload["data"]["message"]);
                }
            }
            Err(e) => {
                log::debug!("Presence stream ended: {}", e);
                break;
            }
        }
    }
    let _ = dropped.send(());
}

pub struct IpcSession {
    writer: SharedWriter,
    watcher: JoinHandle<()>,
    pid: u32,
}

impl IpcSession {
    async fn set_activity(&mut self, activity: Option<&Activity>) -> Result<(), PresenceError> {
        if self.watcher.is_finished() {
            return Err(PresenceError::NotConnected);
        }

        let mut args = json!({ "pid": self.pid });
        if let Some(activity) = activity {
            args["activity"] = serde_json::to_value(activity)
                .map_err(|e| PresenceError::Protocol(e.to_string()))?;
        }
        let command = json!({
            "cmd": "SET_ACTIVITY",
            "args": args,
            "nonce": Uuid::new_v4().to_string(),
        });

        write_frame(&self.writer, OP_FRAME, &command)
            .await
            .map_err(|e| match e {
                PresenceError::Io(_) => PresenceError::NotConnected,
                other => other,
            })
    }
}

#[async_trait]
impl PresenceSession for IpcSession {
    async fn publish(&mut self, activity: &Activity) -> Result<(), PresenceError> {
        self.set_activity(Some(activity)).await
    }

    async fn clear(&mut self) -> Result<(), PresenceError> {
        self.set_activity(None).await
    }

    async fn close(&mut self) {
        let _ = write_frame(&self.writer, OP_CLOSE, &json!({})).await;
        let _ = self.writer.lock().await.shutdown().await;
        self.watcher.abort();
    }
}

impl Drop for IpcSession {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[cfg(unix)]
mod platform {
    use super::{BoxedReader, BoxedWriter, PIPE_SLOTS};
    use crate::presence::PresenceError;
    use std::path::PathBuf;
    use tokio::net::UnixStream;

    fn socket_dirs() -> Vec<PathBuf> {
        ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
            .iter()
            .filter_map(std::env::var_os)
            .map(PathBuf::from)
            .chain(std::iter::once(PathBuf::from("/tmp")))
            .collect()
    }

    pub async fn open() -> Result<(BoxedReader, BoxedWriter), PresenceError> {
        for dir in socket_dirs() {
            for slot in 0..PIPE_SLOTS {
                let path = dir.join(format!("discord-ipc-{}", slot));
                if let Ok(stream) = UnixStream::connect(&path).await {
                    log::debug!("Presence socket found at {}", path.display());
                    let (reader, writer) = stream.into_split();
                    return Ok((Box::new(reader), Box::new(writer)));
                }
            }
        }
        Err(PresenceError::Unavailable)
    }
}

#[cfg(windows)]
mod platform {
    use super::{BoxedReader, BoxedWriter, PIPE_SLOTS};
    use crate::presence::PresenceError;
    use tokio::net::windows::named_pipe::ClientOptions;

    pub async fn open() -> Result<(BoxedReader, BoxedWriter), PresenceError> {
        for slot in 0..PIPE_SLOTS {
            let name = format!(r"\\?\pipe\discord-ipc-{}", slot);
            if let Ok(pipe) = ClientOptions::new().open(&name) {
                log::debug!("Presence pipe found at {}", name);
                let (reader, writer) = tokio::io::split(pipe);
                return Ok((Box::new(reader), Box::new(writer)));
            }
        }
        Err(PresenceError::Unavailable)
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::{BoxedReader, BoxedWriter};
    use crate::presence::PresenceError;

    pub async fn open() -> Result<(BoxedReader, BoxedWriter), PresenceError> {
        Err(PresenceError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::presence::activity::{ActivityBuilder, TimestampAnchor};
    use crate::presence::NowPlaying;
    use crate::track::{PlaybackProgress, Source, Track};
    use chrono::Utc;
    use tokio::io::{duplex, split, DuplexStream};

    async fn send(server: &mut DuplexStream, opcode: u32, payload: Value) {
        server.write_all(&encode_frame(opcode, &payload)).await.unwrap();
    }

    fn activity() -> Activity {
        let now_playing = NowPlaying {
            track: Arc::new(Track {
                title: "Title".into(),
                artist: "Artist".into(),
                album: None,
                duration: 180.0,
                artwork: None,
                source: Source::YouTubeMusic,
            }),
            progress: PlaybackProgress {
                current_time: 3.0,
                paused: false,
                observed_at: Utc::now(),
            },
        };
        ActivityBuilder::new(&PresenceConfig::default())
            .build(&now_playing, &mut TimestampAnchor::default())
    }

    #[test]
    fn frame_header_is_little_endian() {
        let frame = encode_frame(OP_PING, &json!({}));
        assert_eq!(&frame[..4], &[3, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[2, 0, 0, 0]);
        assert_eq!(&frame[8..], b"{}");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&OP_FRAME.to_le_bytes());
        bytes.extend_from_slice(&(1_000_000u32).to_le_bytes());
        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, PresenceError::Protocol(_)));
    }

    #[tokio::test]
    async fn handshake_publish_and_ping() {
        let (client, mut server) = duplex(16 * 1024);
        let (reader, writer) = split(client);

        let service = tokio::spawn(async move {
            let (opcode, hello) = read_frame(&mut server).await.unwrap();
            assert_eq!(opcode, OP_HANDSHAKE);
            assert_eq!(hello["client_id"], "1234");
            assert_eq!(hello["v"], 1);
            send(&mut server, OP_FRAME, json!({"cmd": "DISPATCH", "evt": "READY", "data": {}})).await;

            let (opcode, command) = read_frame(&mut server).await.unwrap();
            assert_eq!(opcode, OP_FRAME);
            assert_eq!(command["cmd"], "SET_ACTIVITY");
            assert_eq!(command["args"]["activity"]["details"], "Title");
            assert!(command["nonce"].is_string());

            send(&mut server, OP_PING, json!({"n": 7})).await;
            let (opcode, pong) = read_frame(&mut server).await.unwrap();
            assert_eq!(opcode, OP_PONG);
            assert_eq!(pong["n"], 7);

            let (_, cleared) = read_frame(&mut server).await.unwrap();
            assert!(cleared["args"].get("activity").is_none());
            // Dropping the stream ends the session
        });

        let Connection {
            mut session,
            dropped,
        } = establish("1234", reader, writer).await.unwrap();

        session.publish(&activity()).await.unwrap();
        // Let the ping round trip finish before the clear goes out
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        session.clear().await.unwrap();

        service.await.unwrap();
        let _ = dropped.await;

        // Give the watcher a moment to be marked finished
        tokio::task::yield_now().await;
        assert!(matches!(
            session.publish(&activity()).await,
            Err(PresenceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn handshake_rejection_is_reported() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = split(client);

        tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            send(&mut server, OP_CLOSE, json!({"code": 4000, "message": "Invalid Client ID"})).await;
        });

        match establish("bad", reader, writer).await {
            Err(PresenceError::Handshake(message)) => assert_eq!(message, "Invalid Client ID"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("handshake should fail"),
        }
    }
}
