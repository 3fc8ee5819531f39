use kv_wire::Frame;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A minimal RESP client for exercising a server under test.
///
/// Frames travel through the same `kv-wire` codec the server uses, so an
/// assertion failure points at behavior, not at a second codec.
pub struct RespClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one command as an array of bulk strings.
    pub async fn send_command(&mut self, parts: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
        self.writer
            .write_all(&kv_wire::encode_bulk_array(parts))
            .await?;
        Ok(())
    }

    /// Read one reply frame.
    pub async fn read_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        let (frame, _consumed) = kv_wire::read_frame(&mut self.reader).await?;
        Ok(frame)
    }

    /// Send a command and read its single reply.
    pub async fn roundtrip(&mut self, parts: &[&str]) -> Result<Frame, Box<dyn std::error::Error>> {
        self.send_command(parts).await?;
        self.read_frame().await
    }

    /// Send raw bytes, for malformed-input tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }
}
