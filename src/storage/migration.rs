//! Volume migration streaming (push / pull).
//!
//! States: Init → Negotiate → StreamData (→ StreamSnapshots)* → Finalize →
//! Done | Failed. Failure at any state is terminal; partial data on the sink
//! side is garbage-collected by the volume delete that follows.
//!
//! Wire ordering: the metadata envelope precedes bulk data; bulk data
//! precedes any snapshot sub-stream; each snapshot sub-stream is
//! self-delimiting (name header, data frames, empty terminator frame).

use crate::storage::StorageError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    Push,
    Pull,
}

impl MigrationMode {
    /// Parses the wire value. Anything but "push"/"pull" is a validation
    /// error and must not create a volume.
    pub fn parse(mode: &str) -> Result<Self, StorageError> {
        match mode {
            "push" => Ok(MigrationMode::Push),
            "pull" => Ok(MigrationMode::Pull),
            other => Err(StorageError::Validation(format!(
                "Invalid migration mode: {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Init,
    Negotiate,
    StreamData,
    StreamSnapshots,
    Finalize,
    Done,
    Failed,
}

/// Metadata envelope, first thing on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEnvelope {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// May legitimately be empty even when the source has snapshots (some
    /// backends materialize them on their own); consumers must not assume
    /// presence.
    #[serde(default)]
    pub snapshots: Vec<String>,
    #[serde(default)]
    pub volume_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct NegotiateRequest {
    secret: String,
    volume_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    name: String,
}

/// Receiving half of a migration. In pull mode the sink opens a WebSocket
/// tunnel to the sender's operation URL using the provided secret; the
/// sender drives the stream.
pub struct MigrationSink {
    state: MigrationState,
    mode: MigrationMode,
    operation_url: String,
    secret: String,
    volume_only: bool,
    cancel: Arc<AtomicBool>,
}

impl MigrationSink {
    pub fn new(
        mode: MigrationMode,
        operation_url: impl Into<String>,
        secret: impl Into<String>,
        volume_only: bool,
    ) -> Self {
        Self {
            state: MigrationState::Init,
            mode,
            operation_url: operation_url.into(),
            secret: secret.into(),
            volume_only,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Handle observed at state boundaries only; mid-frame cancellation
    /// terminates the connection and lets the follow-up delete clean up.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Runs the transfer, materializing data under `volume_path`. Any error
    /// leaves the sink in `Failed` permanently.
    pub async fn run(&mut self, volume_path: &Path) -> Result<MigrationEnvelope, StorageError> {
        match self.run_inner(volume_path).await {
            Ok(envelope) => {
                self.state = MigrationState::Done;
                Ok(envelope)
            }
            Err(err) => {
                self.state = MigrationState::Failed;
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self, volume_path: &Path) -> Result<MigrationEnvelope, StorageError> {
        self.transition(MigrationState::Negotiate)?;

        let (mut ws, _) = tokio_tungstenite::connect_async(self.operation_url.as_str())
            .await
            .map_err(|e| {
                StorageError::Driver(format!(
                    "Failed to open migration tunnel to {}: {}",
                    self.operation_url, e
                ))
            })?;

        let request = NegotiateRequest {
            secret: self.secret.clone(),
            volume_only: self.volume_only,
        };
        let payload = serde_json::to_string(&request)
            .map_err(|e| StorageError::Driver(e.to_string()))?;
        ws.send(Message::Text(payload))
            .await
            .map_err(|e| StorageError::Driver(format!("Migration negotiate failed: {}", e)))?;

        let envelope: MigrationEnvelope = match next_frame(&mut ws).await? {
            Message::Text(text) => serde_json::from_str(&text).map_err(|e| {
                StorageError::Driver(format!("Invalid migration envelope: {}", e))
            })?,
            other => {
                return Err(StorageError::Driver(format!(
                    "Expected migration envelope, got {:?}",
                    other
                )))
            }
        };

        self.transition(MigrationState::StreamData)?;
        fs::create_dir_all(volume_path)
            .await
            .map_err(|e| StorageError::Driver(e.to_string()))?;
        receive_stream(&mut ws, &volume_path.join("volume.dat")).await?;

        if !self.volume_only && !envelope.volume_only {
            self.transition(MigrationState::StreamSnapshots)?;
            let snapshot_dir = volume_path.join(".snapshots");
            for _ in 0..envelope.snapshots.len() {
                let header: SnapshotHeader = match next_frame(&mut ws).await? {
                    Message::Text(text) => serde_json::from_str(&text).map_err(|e| {
                        StorageError::Driver(format!("Invalid snapshot header: {}", e))
                    })?,
                    other => {
                        return Err(StorageError::Driver(format!(
                            "Expected snapshot header, got {:?}",
                            other
                        )))
                    }
                };
                fs::create_dir_all(&snapshot_dir)
                    .await
                    .map_err(|e| StorageError::Driver(e.to_string()))?;
                receive_stream(&mut ws, &snapshot_dir.join(format!("{}.dat", header.name)))
                    .await?;
            }
        }

        self.transition(MigrationState::Finalize)?;
        match next_frame(&mut ws).await? {
            Message::Text(text) if text == "done" => {}
            other => {
                return Err(StorageError::Driver(format!(
                    "Expected completion marker, got {:?}",
                    other
                )))
            }
        }
        let _ = ws.send(Message::Close(None)).await;

        Ok(envelope)
    }

    fn transition(&mut self, next: MigrationState) -> Result<(), StorageError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(StorageError::Driver("Migration cancelled".into()));
        }
        log::debug!(
            "Migration sink ({:?}): {:?} -> {:?}",
            self.mode,
            self.state,
            next
        );
        self.state = next;
        Ok(())
    }
}

/// Push-mode receiving half: the sender connected to our operation socket
/// and drives the stream. The first frame is the envelope, which must carry
/// the expected secret.
pub async fn run_sink_accepted<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    volume_path: &Path,
    secret: &str,
    volume_only: bool,
) -> Result<MigrationEnvelope, StorageError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let envelope: MigrationEnvelope = match next_frame(ws).await? {
        Message::Text(text) => serde_json::from_str(&text)
            .map_err(|e| StorageError::Driver(format!("Invalid migration envelope: {}", e)))?,
        other => {
            return Err(StorageError::Driver(format!(
                "Expected migration envelope, got {:?}",
                other
            )))
        }
    };
    if envelope.config.get("migration.secret").map(String::as_str) != Some(secret) {
        return Err(StorageError::Validation("Invalid migration secret".into()));
    }

    fs::create_dir_all(volume_path)
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    receive_stream(ws, &volume_path.join("volume.dat")).await?;

    if !volume_only && !envelope.volume_only {
        let snapshot_dir = volume_path.join(".snapshots");
        for _ in 0..envelope.snapshots.len() {
            let header: SnapshotHeader = match next_frame(ws).await? {
                Message::Text(text) => serde_json::from_str(&text)
                    .map_err(|e| StorageError::Driver(format!("Invalid snapshot header: {}", e)))?,
                other => {
                    return Err(StorageError::Driver(format!(
                        "Expected snapshot header, got {:?}",
                        other
                    )))
                }
            };
            fs::create_dir_all(&snapshot_dir)
                .await
                .map_err(|e| StorageError::Driver(e.to_string()))?;
            receive_stream(ws, &snapshot_dir.join(format!("{}.dat", header.name))).await?;
        }
    }

    match next_frame(ws).await? {
        Message::Text(text) if text == "done" => Ok(envelope),
        other => Err(StorageError::Driver(format!(
            "Expected completion marker, got {:?}",
            other
        ))),
    }
}

/// Sending half. The caller hands over an established WebSocket (push mode
/// connects out, pull mode is the accepted operation socket); this drives
/// envelope, bulk data, snapshot sub-streams, completion marker.
pub async fn run_source<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    envelope: &MigrationEnvelope,
    volume_path: &Path,
) -> Result<(), StorageError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    // The receiver opens with its negotiate request.
    match next_frame(ws).await? {
        Message::Text(_) => {}
        other => {
            return Err(StorageError::Driver(format!(
                "Expected negotiate request, got {:?}",
                other
            )))
        }
    }

    let payload =
        serde_json::to_string(envelope).map_err(|e| StorageError::Driver(e.to_string()))?;
    ws.send(Message::Text(payload))
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;

    send_stream(ws, &volume_path.join("volume.dat")).await?;

    if !envelope.volume_only {
        for snapshot in &envelope.snapshots {
            let header = serde_json::to_string(&SnapshotHeader {
                name: snapshot.clone(),
            })
            .map_err(|e| StorageError::Driver(e.to_string()))?;
            ws.send(Message::Text(header))
                .await
                .map_err(|e| StorageError::Driver(e.to_string()))?;
            send_stream(ws, &volume_path.join(".snapshots").join(format!("{}.dat", snapshot)))
                .await?;
        }
    }

    ws.send(Message::Text("done".to_string()))
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

const STREAM_CHUNK: usize = 1 << 20;

async fn send_stream<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    path: &Path,
) -> Result<(), StorageError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(StorageError::Driver(e.to_string())),
    };
    for chunk in data.chunks(STREAM_CHUNK) {
        ws.send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(|e| StorageError::Driver(e.to_string()))?;
    }
    // Empty binary frame delimits the stream.
    ws.send(Message::Binary(Vec::new()))
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

async fn receive_stream<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    target: &Path,
) -> Result<(), StorageError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut file = fs::File::create(target)
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    loop {
        match next_frame(ws).await? {
            Message::Binary(data) if data.is_empty() => break,
            Message::Binary(data) => {
                file.write_all(&data)
                    .await
                    .map_err(|e| StorageError::Driver(e.to_string()))?;
            }
            other => {
                return Err(StorageError::Driver(format!(
                    "Expected data frame, got {:?}",
                    other
                )))
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| StorageError::Driver(e.to_string()))?;
    Ok(())
}

async fn next_frame<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
) -> Result<Message, StorageError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(message)) => return Ok(message),
            Some(Err(e)) => {
                return Err(StorageError::Driver(format!("Migration stream error: {}", e)))
            }
            None => {
                return Err(StorageError::Driver(
                    "Migration peer disconnected mid-stream".into(),
                ))
            }
        }
    }
}

/// Generates the per-transfer secret handed to the peer.
pub fn migration_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    #[test]
    fn mode_parsing_is_strict() {
        assert_eq!(MigrationMode::parse("push").unwrap(), MigrationMode::Push);
        assert_eq!(MigrationMode::parse("pull").unwrap(), MigrationMode::Pull);
        assert!(matches!(
            MigrationMode::parse("relay"),
            Err(StorageError::Validation(_))
        ));
        assert!(MigrationMode::parse("").is_err());
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn pull_transfer_reaches_done() {
        let (listener, url) = listen().await;

        // Source side: a staged volume with one snapshot.
        let source_dir = tempdir().unwrap();
        std::fs::write(source_dir.path().join("volume.dat"), b"bulk-data").unwrap();
        std::fs::create_dir_all(source_dir.path().join(".snapshots")).unwrap();
        std::fs::write(source_dir.path().join(".snapshots/s0.dat"), b"snap-data").unwrap();

        let source_path = source_dir.path().to_path_buf();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let envelope = MigrationEnvelope {
                name: "v1".to_string(),
                kind: "custom".to_string(),
                config: HashMap::new(),
                snapshots: vec!["s0".to_string()],
                volume_only: false,
            };
            run_source(&mut ws, &envelope, &source_path).await.unwrap();
        });

        let target_dir = tempdir().unwrap();
        let mut sink = MigrationSink::new(MigrationMode::Pull, url, "secret", false);
        let envelope = sink.run(target_dir.path()).await.unwrap();

        assert_eq!(sink.state(), MigrationState::Done);
        assert_eq!(envelope.snapshots, vec!["s0".to_string()]);
        assert_eq!(
            std::fs::read(target_dir.path().join("volume.dat")).unwrap(),
            b"bulk-data"
        );
        assert_eq!(
            std::fs::read(target_dir.path().join(".snapshots/s0.dat")).unwrap(),
            b"snap-data"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn sender_disconnect_mid_data_is_terminal() {
        let (listener, url) = listen().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Read negotiate, send envelope, one data frame, then vanish.
            let _ = ws.next().await;
            let envelope = MigrationEnvelope {
                name: "v1".to_string(),
                kind: "custom".to_string(),
                config: HashMap::new(),
                snapshots: vec![],
                volume_only: true,
            };
            ws.send(Message::Text(serde_json::to_string(&envelope).unwrap()))
                .await
                .unwrap();
            ws.send(Message::Binary(b"partial".to_vec())).await.unwrap();
            drop(ws);
        });

        let target_dir = tempdir().unwrap();
        let mut sink = MigrationSink::new(MigrationMode::Pull, url, "secret", true);
        let err = sink.run(target_dir.path()).await.unwrap_err();

        assert_eq!(sink.state(), MigrationState::Failed);
        assert!(matches!(err, StorageError::Driver(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn volume_only_elides_snapshot_streams() {
        let (listener, url) = listen().await;

        let source_dir = tempdir().unwrap();
        std::fs::write(source_dir.path().join("volume.dat"), b"bulk").unwrap();

        let source_path = source_dir.path().to_path_buf();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let envelope = MigrationEnvelope {
                name: "v1".to_string(),
                kind: "custom".to_string(),
                config: HashMap::new(),
                snapshots: vec![],
                volume_only: true,
            };
            run_source(&mut ws, &envelope, &source_path).await.unwrap();
        });

        let target_dir = tempdir().unwrap();
        let mut sink = MigrationSink::new(MigrationMode::Pull, url, "secret", true);
        sink.run(target_dir.path()).await.unwrap();

        assert_eq!(sink.state(), MigrationState::Done);
        assert!(!target_dir.path().join(".snapshots").exists());
        server.await.unwrap();
    }
}
