//! Server pinger: a one-shot status-phase handshake used to gate emulated-client
//! establishment on the internal side.
//!
//! Opens a short-lived TCP connection, performs the handshake + status request, and resolves
//! once a status response comes back -- we don't need the reply's payload, only the fact that the
//! server answered.

use crate::codec::{ByteReader, ByteWriter, LengthPrefixedCodec};
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// Default time allowed for the whole ping round-trip before giving up.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a TCP connection to `(host, port)`, performs a status-phase handshake and status
/// request, and returns `Ok(())` once a status response frame is received. Used on the internal
/// side as a gate before opening an emulated-client connection to the real server:
/// a successful ping means the server is reachable and likely to accept the follow-up connection.
pub async fn ping(host: &str, port: u16, protocol_version: i32) -> io::Result<()> {
    timeout(DEFAULT_PING_TIMEOUT, ping_inner(host, port, protocol_version))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "server ping timed out"))?
}

async fn ping_inner(host: &str, port: u16, protocol_version: i32) -> io::Result<()> {
    let stream = TcpStream::connect((host, port)).await?;
    let mut framed = Framed::new(stream, LengthPrefixedCodec::new(1 << 20));

    let mut handshake = ByteWriter::new();
    handshake.write_varint(0x00);
    handshake.write_varint(protocol_version);
    handshake.write_string(host);
    handshake.write_u16(port);
    handshake.write_varint(1); // next_state = status
    framed
        .send(handshake.into_inner())
        .await
        .map_err(io::Error::other)?;

    let mut status_request = ByteWriter::new();
    status_request.write_varint(0x00);
    framed
        .send(status_request.into_inner())
        .await
        .map_err(io::Error::other)?;

    match framed.next().await {
        Some(Ok(frame)) => {
            let mut reader = ByteReader::new(&frame[..]);
            let _packet_id = reader
                .read_varint()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            Ok(())
        }
        Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before status response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ping_succeeds_against_a_server_that_answers_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // drain the handshake + status request, don't bother decoding their contents.
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();

            let mut writer = ByteWriter::new();
            writer.write_varint(0x00);
            writer.write_string("{}");
            let body = writer.into_inner();
            let mut framed_reply = ByteWriter::new();
            framed_reply.write_varint(body.len() as i32);
            framed_reply.write_raw(&body);
            socket.write_all(&framed_reply.into_inner()).await.unwrap();
        });

        ping(&addr.ip().to_string(), addr.port(), 340).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ping_fails_against_a_server_that_closes_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let result = ping(&addr.ip().to_string(), addr.port(), 340).await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
