//! Newline-delimited JSON framing over TCP
//!
//! A request is one JSON line, answered by one `Reply` line. Block payloads
//! are raw bytes written between frames; the reader side keeps a single
//! `BufReader` so bytes buffered past a frame are never lost.

use std::net::SocketAddr;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::MAX_FRAME_SIZE;

/// Response frame: the value or the error text.
pub type Reply<T> = Result<T, String>;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame longer than {0} bytes")]
    FrameTooLong(usize),
}

impl WireError {
    /// True when the peer answered with exactly this error text.
    pub fn is_remote(&self, text: &str) -> bool {
        matches!(self, WireError::Remote(e) if e == text)
    }
}

pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: Option<SocketAddr>,
    peer: String,
    debug: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, debug: bool) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let peer = peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer_addr,
            peer,
            debug,
        }
    }

    pub async fn connect(addr: &str, debug: bool) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, debug))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Write one frame.
    pub async fn send<T: Serialize + ?Sized>(&mut self, frame: &T) -> Result<(), WireError> {
        let mut line = serde_json::to_string(frame).map_err(WireError::Encode)?;
        if self.debug {
            log::info!("{} <- {}", self.peer, line);
        }
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` on a clean EOF between frames. A frame
    /// over `MAX_FRAME_SIZE` leaves the stream unusable.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        let mut line = String::new();
        let n = (&mut self.reader)
            .take(MAX_FRAME_SIZE as u64)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n == MAX_FRAME_SIZE && !line.ends_with('\n') {
            return Err(WireError::FrameTooLong(MAX_FRAME_SIZE));
        }
        let line = line.trim_end();
        if self.debug {
            log::info!("{} -> {}", self.peer, line);
        }
        serde_json::from_str(line).map(Some).map_err(WireError::Decode)
    }

    pub async fn reply_ok<T: Serialize>(&mut self, value: T) -> Result<(), WireError> {
        let reply: Reply<T> = Ok(value);
        self.send(&reply).await
    }

    pub async fn reply_err(&mut self, text: &str) -> Result<(), WireError> {
        let reply: Reply<()> = Err(text.to_string());
        self.send(&reply).await
    }

    /// Send a request and wait for its reply.
    pub async fn call<Req, Resp>(&mut self, request: &Req) -> Result<Resp, WireError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send(request).await?;
        match self.recv::<Reply<Resp>>().await? {
            Some(Ok(value)) => Ok(value),
            Some(Err(text)) => Err(WireError::Remote(text)),
            None => Err(WireError::Closed),
        }
    }

    /// Raw byte source for block payloads following a frame.
    pub fn reader_mut(&mut self) -> &mut BufReader<OwnedReadHalf> {
        &mut self.reader
    }

    /// Raw byte sink for block payloads following a frame.
    pub fn writer_mut(&mut self) -> &mut OwnedWriteHalf {
        &mut self.writer
    }
}
