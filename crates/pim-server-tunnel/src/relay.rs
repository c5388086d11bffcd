//! Bidirectional byte relay
//!
//! Two copy loops run concurrently inside one task. Each reads at most one
//! chunk and writes it out in full before reading again, so a slow reader
//! pushes back on the fast writer through TCP. When either loop stops (EOF
//! or error) the other is cancelled and both connections are shut down.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes read per copy step
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Direction of a copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToInstance,
    InstanceToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToInstance => write!(f, "client -> instance"),
            Direction::InstanceToClient => write!(f, "instance -> client"),
        }
    }
}

/// Totals for one relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_instance: u64,
    pub instance_to_client: u64,
    /// The loop that stopped first
    pub closed_by: Direction,
}

/// Relay between `client` and `instance` until one side is done
///
/// Both streams are shut down and dropped before this returns.
pub async fn relay<C, I>(client: C, instance: I) -> RelayStats
where
    C: AsyncRead + AsyncWrite,
    I: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut instance_read, mut instance_write) = tokio::io::split(instance);

    let mut client_to_instance = 0u64;
    let mut instance_to_client = 0u64;

    let (closed_by, result) = tokio::select! {
        result = copy_chunks(&mut client_read, &mut instance_write, &mut client_to_instance) => {
            (Direction::ClientToInstance, result)
        }
        result = copy_chunks(&mut instance_read, &mut client_write, &mut instance_to_client) => {
            (Direction::InstanceToClient, result)
        }
    };

    match result {
        Ok(()) => debug!("Relay {} reached EOF", closed_by),
        Err(e) => debug!("Relay {} failed: {}", closed_by, e),
    }

    let _ = client_write.shutdown().await;
    let _ = instance_write.shutdown().await;

    RelayStats {
        client_to_instance,
        instance_to_client,
        closed_by,
    }
}

/// Copy until EOF or error, counting forwarded bytes into `total`
async fn copy_chunks<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, mut client_peer) = duplex(64);
        let (instance, mut instance_peer) = duplex(64);

        let handle = tokio::spawn(relay(client, instance));

        client_peer.write_all(b"hello instance").await.unwrap();
        let mut buf = [0u8; 14];
        instance_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello instance");

        instance_peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // Client hangs up; the instance side sees EOF too
        drop(client_peer);
        let mut rest = Vec::new();
        instance_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = handle.await.unwrap();
        assert_eq!(stats.client_to_instance, 14);
        assert_eq!(stats.instance_to_client, 2);
        assert_eq!(stats.closed_by, Direction::ClientToInstance);
    }

    #[tokio::test]
    async fn test_relay_large_transfer_with_small_pipes() {
        let (client, mut client_peer) = duplex(1024);
        let (instance, mut instance_peer) = duplex(1024);
        let handle = tokio::spawn(relay(client, instance));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client_peer.write_all(&payload).await.unwrap();
            client_peer
        });

        let mut received = vec![0u8; expected.len()];
        instance_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        // Instance closes first this time
        drop(instance_peer);
        let mut client_peer = writer.await.unwrap();
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.client_to_instance, 200_000);
        assert_eq!(stats.closed_by, Direction::InstanceToClient);
    }
}
