//! Local IPC endpoint accepting externally-submitted download requests. See
//! SPEC_FULL.md §4.10.
//!
//! No direct teacher analogue exists (the teacher is a one-shot CLI with no listener);
//! enriched from the broader corpus's standard `tokio::net::UnixListener` accept-loop
//! idiom and from `pulith-fs`'s `fs2::FileExt` advisory-lock pattern
//! (`crates/pulith-fs/src/workflow/transaction.rs`), reused here to guard the socket
//! path against a second instance racing to bind it. Error handling follows
//! `src/queue/mod.rs`'s per-call fallibility: a malformed frame produces an error reply
//! without tearing down the listener.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::engine::{AddRequest, DownloadEngine};
use crate::error::DownloadError;
use crate::queue_manager::QueueManager;
use crate::storage::Priority;

const DEFAULT_THREADS: u32 = 4;
const LIVENESS_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct AddFrame {
    url: String,
    filename: Option<String>,
    referrer: Option<String>,
    #[serde(rename = "fileSize")]
    file_size: Option<u64>,
    mime: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddReply {
    success: bool,
    id: Option<String>,
    filename: Option<String>,
    error: Option<String>,
}

/// Owns the bound Unix domain socket, its companion advisory-lock file, and the
/// accept-loop task. Dropping this without calling [`IngressBridge::shutdown`] leaves
/// the accept task running and the socket file on disk; callers should always shut it
/// down on process exit.
pub struct IngressBridge {
    accept_task: JoinHandle<()>,
    socket_path: PathBuf,
    _lock_file: std::fs::File,
}

impl IngressBridge {
    /// Binds `socket_path`, replacing it first if a liveness probe shows it's stale,
    /// and starts servicing connections.
    #[instrument(skip(engine, queue))]
    pub async fn bind(
        socket_path: PathBuf,
        engine: Arc<DownloadEngine>,
        queue: Arc<QueueManager>,
        output_dir: PathBuf,
    ) -> Result<Self, DownloadError> {
        ensure_fresh_socket(&socket_path).await?;
        let lock_file = acquire_lock_file(&socket_path)?;
        let listener = UnixListener::bind(&socket_path).map_err(|e| DownloadError::fs_io(&socket_path, e))?;
        let accept_task = tokio::spawn(accept_loop(listener, engine, queue, output_dir));
        Ok(Self { accept_task, socket_path, _lock_file: lock_file })
    }

    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        let _ = tokio::fs::remove_file(lock_path_for(&self.socket_path)).await;
    }
}

async fn ensure_fresh_socket(path: &Path) -> Result<(), DownloadError> {
    if !path.exists() {
        return Ok(());
    }
    if probe_liveness(path).await {
        return Err(DownloadError::internal(format!("ingress socket {} is already in use", path.display())));
    }
    debug!(path = %path.display(), "replacing stale ingress socket");
    tokio::fs::remove_file(path).await.map_err(|e| DownloadError::fs_io(path, e))?;
    Ok(())
}

/// Connects to an existing socket and writes a PING frame; any byte read back within
/// the timeout means a live listener is servicing it.
async fn probe_liveness(path: &Path) -> bool {
    let Ok(mut stream) = UnixStream::connect(path).await else {
        return false;
    };
    if stream.write_all(b"{\"type\":\"PING\"}\n").await.is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    matches!(tokio::time::timeout(LIVENESS_TIMEOUT, stream.read(&mut byte)).await, Ok(Ok(n)) if n > 0)
}

fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut os_string = socket_path.as_os_str().to_owned();
    os_string.push(".lock");
    PathBuf::from(os_string)
}

fn acquire_lock_file(socket_path: &Path) -> Result<std::fs::File, DownloadError> {
    let lock_path = lock_path_for(socket_path);
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| DownloadError::fs_io(&lock_path, e))?;
    file.try_lock_exclusive()
        .map_err(|_| DownloadError::internal(format!("ingress lock {} is held by another process", lock_path.display())))?;
    Ok(file)
}

async fn accept_loop(listener: UnixListener, engine: Arc<DownloadEngine>, queue: Arc<QueueManager>, output_dir: PathBuf) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "ingress accept failed");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        let queue = Arc::clone(&queue);
        let output_dir = output_dir.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &engine, &queue, &output_dir).await {
                warn!(%err, "ingress connection error");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    engine: &Arc<DownloadEngine>,
    queue: &Arc<QueueManager>,
    output_dir: &Path,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let reply = match serde_json::from_str::<AddFrame>(&line) {
        Ok(frame) => process_frame(frame, engine, queue, output_dir).await,
        Err(err) => {
            warn!(%err, "malformed ingress frame");
            AddReply { success: false, id: None, filename: None, error: Some(format!("invalid frame: {err}")) }
        }
    };

    let mut payload = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{\"success\":false}".to_vec());
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.shutdown().await?;
    Ok(())
}

#[instrument(skip(engine, queue, output_dir), fields(url = %frame.url))]
async fn process_frame(frame: AddFrame, engine: &Arc<DownloadEngine>, queue: &Arc<QueueManager>, output_dir: &Path) -> AddReply {
    debug!(file_size_hint = ?frame.file_size, mime = ?frame.mime, "ingress frame received");

    let request = AddRequest {
        url: frame.url,
        referrer: frame.referrer,
        filename: frame.filename,
        output_dir: output_dir.to_path_buf(),
        threads: DEFAULT_THREADS,
        priority: Priority::Normal,
        checksum: None,
        checksum_type: None,
        speed_limit_bps: 0,
    };

    let id = match engine.add(request).await {
        Ok(id) => id,
        Err(err) => return AddReply { success: false, id: None, filename: None, error: Some(err.to_string()) },
    };

    if let Err(err) = queue.enqueue(&id, Priority::Normal).await {
        return AddReply { success: false, id: Some(id), filename: None, error: Some(err.to_string()) };
    }

    let filename = engine.get(&id).await.ok().flatten().map(|download| download.filename);
    AddReply { success: true, id: Some(id), filename, error: None }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::storage::Storage;
    use crate::test_support::start_mock_server_or_skip;
    use reqwest::Client;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path as path_matcher};
    use wiremock::{Mock, ResponseTemplate};

    async fn test_engine() -> Arc<DownloadEngine> {
        Arc::new(DownloadEngine::new(Storage::open_in_memory().await.unwrap(), Client::new(), RetryPolicy::default()))
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        let socket = PathBuf::from("/tmp/dlaccel/dlaccel.sock");
        assert_eq!(lock_path_for(&socket), PathBuf::from("/tmp/dlaccel/dlaccel.sock.lock"));
    }

    #[tokio::test]
    async fn test_probe_liveness_is_false_for_nonexistent_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        assert!(!probe_liveness(&path).await);
    }

    #[tokio::test]
    async fn test_ensure_fresh_socket_removes_a_stale_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // A regular file at the socket path with nothing listening behind it: the
        // connect attempt fails, so this should be treated as stale and removed.
        std::fs::write(&path, b"not a socket").unwrap();
        ensure_fresh_socket(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_serves_an_add_frame_and_replies_with_an_id() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .and(path_matcher("/file.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "20"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("ingress.sock");
        let output_dir = dir.path().join("downloads");
        let engine = test_engine().await;
        let queue = Arc::new(QueueManager::new(Arc::clone(&engine), 2, false, 3));

        let bridge = IngressBridge::bind(socket_path.clone(), Arc::clone(&engine), Arc::clone(&queue), output_dir)
            .await
            .unwrap();

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let frame = format!("{{\"url\":\"{}/file.bin\"}}\n", server.uri());
        client.write_all(frame.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut response).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(reply["success"], serde_json::Value::Bool(true));
        assert!(reply["id"].is_string());

        bridge.shutdown().await;
        queue.shutdown().await;
    }
}
