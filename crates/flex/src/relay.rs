//! Client side of an attach session: local terminal ⇄ relay connection.
//!
//! Standard input is read on a plain thread, since blocking terminal reads
//! cannot be cancelled, and forwarded through a channel. The session ends
//! when the daemon closes the relay connection.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::io::{self, IsTerminal, Read};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ClientError, Result};

const STDIN_CHUNK: usize = 1024;

/// Puts the terminal in raw mode until dropped.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        enable_raw_mode().map_err(ClientError::Terminal)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Relays the process's stdin and stdout over `conn` until the daemon
/// closes it. Raw mode is used when stdin is a terminal.
pub async fn run_terminal<S>(conn: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let _raw = if io::stdin().is_terminal() {
        Some(RawModeGuard::new()?)
    } else {
        None
    };

    let input = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();
    let copied = relay(conn, input, &mut stdout).await?;
    debug!(bytes = copied, "Attach session ended");
    Ok(())
}

fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; STDIN_CHUNK];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = buf.get(..n).unwrap_or_default().to_vec();
            if tx.blocking_send(chunk).is_err() {
                break;
            }
        }
    });
    rx
}

/// Copies `input` chunks to `conn` and `conn` to `output`.
///
/// Returns once `conn` reaches end-of-file, with the number of bytes
/// written to `output`. When `input` runs dry the write side of `conn` is
/// shut down, which tells the daemon the user is gone.
pub async fn relay<S, W>(conn: S, mut input: mpsc::Receiver<Vec<u8>>, output: &mut W) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);

    let writer = tokio::spawn(async move {
        while let Some(chunk) = input.recv().await {
            conn_write.write_all(&chunk).await?;
        }
        conn_write.shutdown().await
    });

    let mut buf = [0u8; STDIN_CHUNK * 8];
    let mut total: u64 = 0;
    let result = loop {
        match conn_read.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                let chunk = buf.get(..n).unwrap_or_default();
                if let Err(e) = output.write_all(chunk).await {
                    break Err(ClientError::Relay(e));
                }
                if let Err(e) = output.flush().await {
                    break Err(ClientError::Relay(e));
                }
                total += n as u64;
            }
            Err(e) => break Err(ClientError::Relay(e)),
        }
    };

    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_round_trip_until_peer_closes() {
        let (client, mut server) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::channel(4);

        let peer = tokio::spawn(async move {
            let mut got = [0u8; 5];
            server.read_exact(&mut got).await.unwrap();
            server.write_all(b"echo:").await.unwrap();
            server.write_all(&got).await.unwrap();
            // dropping the server closes the relay
            got
        });

        tx.send(b"hello".to_vec()).await.unwrap();
        let mut output = Vec::new();
        let copied = relay(client, rx, &mut output).await.unwrap();

        assert_eq!(&peer.await.unwrap(), b"hello");
        assert_eq!(output, b"echo:hello");
        assert_eq!(copied, 10);
    }

    #[tokio::test]
    async fn test_relay_shuts_down_write_side_when_input_ends() {
        let (client, mut server) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(tx);

        let peer = tokio::spawn(async move {
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            rest.len()
        });

        let mut output = Vec::new();
        relay(client, rx, &mut output).await.unwrap();
        assert_eq!(peer.await.unwrap(), 0);
    }
}
