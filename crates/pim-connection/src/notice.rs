//! Best-effort text notices to connected clients
//!
//! Clients may hang up at any point; a failed write is logged and marks the
//! peer as gone, it never aborts the caller's flow.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Write `text` verbatim, reporting whether the peer accepted it
pub async fn send_notice<W>(writer: &mut W, text: &str) -> bool
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    }
    .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            debug!("Client no longer writable: {}", e);
            false
        }
    }
}

/// Line writer that stops writing once the peer has gone away
pub struct Notifier<W> {
    writer: W,
    connected: bool,
}

impl<W> Notifier<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            connected: true,
        }
    }

    /// Send one newline-terminated line
    pub async fn line(&mut self, text: &str) {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.raw(&line).await;
    }

    /// Send text without adding a terminator
    pub async fn raw(&mut self, text: &str) {
        if self.connected {
            self.connected = send_notice(&mut self.writer, text).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Shut down the write side; the peer sees EOF
    pub async fn close(&mut self) {
        if self.connected {
            let _ = self.writer.shutdown().await;
            self.connected = false;
        }
    }
}
