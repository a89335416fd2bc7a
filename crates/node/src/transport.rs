//! Byte-stream transports and the frame reader/writer that run on top of them.

use async_trait::async_trait;
use dashmap::DashMap;
use sds_protocol::{decode_body, encode_frame, frame_body_len, Envelope, FrameError};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, address: &str) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &str) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// In-process transport over `tokio::io::duplex` pipes. Each bound address hands the far end of
/// every opened pipe to its accept channel.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    listeners: DashMap<String, mpsc::UnboundedSender<BoxedStream>>,
}

impl MemoryTransport {
    pub const PIPE_CAPACITY: usize = 256 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, address: &str) -> mpsc::UnboundedReceiver<BoxedStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(address.to_string(), tx);
        rx
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, address: &str) -> io::Result<BoxedStream> {
        let Some(listener) = self.listeners.get(address).map(|l| l.clone()) else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing bound at {address}"),
            ));
        };
        let (near, far) = tokio::io::duplex(Self::PIPE_CAPACITY);
        listener
            .send(Box::new(far))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, format!("{address} stopped accepting")))?;
        Ok(Box::new(near))
    }
}

/// Outcome of reading one frame off a stream.
#[derive(Debug)]
pub enum ReadFrame {
    Envelope(Envelope),
    /// Body did not decode; the stream is still aligned on the next frame.
    Malformed(FrameError),
    Eof,
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ReadFrame> {
    let mut header = [0u8; sds_protocol::frame::FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadFrame::Eof),
        Err(err) => return Err(err),
    }
    let len = frame_body_len(header).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(match decode_body(&body) {
        Ok(envelope) => ReadFrame::Envelope(envelope),
        Err(err) => ReadFrame::Malformed(err),
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let frame = encode_frame(envelope).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sds_protocol::{Heartbeat, Message};

    fn heartbeat(ts: u64) -> Envelope {
        Envelope::new(
            ts,
            Message::Heartbeat(Heartbeat {
                p2p_address: "12D3KooWpp".into(),
                timestamp_ms: ts,
            }),
        )
    }

    #[tokio::test]
    async fn frames_cross_a_memory_pipe() {
        let transport = MemoryTransport::new();
        let mut accepted = transport.bind("pp-b:9000");
        let mut client = transport.open("pp-b:9000").await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        write_frame(&mut client, &heartbeat(1)).await.unwrap();
        write_frame(&mut client, &heartbeat(2)).await.unwrap();
        drop(client);

        for expected in [1, 2] {
            match read_frame(&mut server).await.unwrap() {
                ReadFrame::Envelope(env) => assert_eq!(env, heartbeat(expected)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(read_frame(&mut server).await.unwrap(), ReadFrame::Eof));
    }

    #[tokio::test]
    async fn garbage_body_keeps_stream_aligned() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        write_frame(&mut a, &heartbeat(9)).await.unwrap();

        assert!(matches!(read_frame(&mut b).await.unwrap(), ReadFrame::Malformed(_)));
        assert!(matches!(read_frame(&mut b).await.unwrap(), ReadFrame::Envelope(_)));
    }

    #[tokio::test]
    async fn unbound_address_refuses() {
        let transport = MemoryTransport::new();
        let err = transport.open("nowhere:1").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
