//! Unix socket server.
//!
//! Each connection carries newline-delimited JSON calls, handled one after
//! another. A call's replies are written as they are produced.

use std::path::PathBuf;
use std::sync::Arc;

use stevedore_core::error::ImageError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;

use crate::protocol::{Call, Reply};
use crate::service::ImageService;

/// Gateway server bound to a Unix domain socket.
pub struct GatewayServer {
    socket_path: PathBuf,
    service: Arc<ImageService>,
}

impl GatewayServer {
    pub fn new(socket_path: PathBuf, service: Arc<ImageService>) -> Self {
        Self {
            socket_path,
            service,
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self) -> anyhow::Result<()> {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        let mut incoming = UnixListenerStream::new(listener);
        tracing::info!(socket = %self.socket_path.display(), "Gateway listening");

        while let Some(stream) = incoming.next().await {
            let stream = stream?;
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(service, stream).await {
                    tracing::debug!(error = %e, "Connection closed with error");
                }
            });
        }
        Ok(())
    }
}

/// Serve calls from one connection until the peer closes it.
///
/// If the peer goes away mid-call the call still runs to completion.
pub async fn serve_connection<S>(service: Arc<ImageService>, stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        match serde_json::from_str::<Call>(&line) {
            Ok(call) => {
                let service = service.clone();
                tokio::spawn(async move { service.handle(call, &tx).await });
            }
            Err(e) => {
                let err = ImageError::InvalidArgument(format!("malformed call: {}", e));
                let _ = tx.send(Reply::fault(&err));
            }
        }

        while let Some(reply) = rx.recv().await {
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
        }
    }
    Ok(())
}
