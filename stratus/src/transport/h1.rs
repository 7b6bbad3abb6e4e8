//! HTTP/1.1 over plain TCP.

use super::{Connection, Connector};
use crate::errors::StratusError;
use crate::http::{names, Endpoint, Headers, Method, RequestHead, ResponseHead, Scheme};
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Connects over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, StratusError> {
        if endpoint.scheme == Scheme::Https {
            return Err(StratusError::ConnectionAcquisition {
                endpoint: endpoint.to_string(),
                message: "TLS is not supported by the plain TCP connector".to_string(),
            });
        }
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| StratusError::ConnectionAcquisition {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %endpoint, "Connected");
        Ok(Box::new(H1Connection::new(stream)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Done,
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
}

/// One HTTP/1.1 connection over any async byte stream.
#[derive(Debug)]
pub struct H1Connection<S> {
    io: S,
    read_buf: BytesMut,
    framing: Framing,
    method: Option<Method>,
    keep_alive: bool,
    broken: bool,
}

impl<S> H1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a connected stream.
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            framing: Framing::Done,
            method: None,
            keep_alive: true,
            broken: false,
        }
    }

    async fn fill(&mut self) -> Result<usize, StratusError> {
        self.read_buf.reserve(READ_CHUNK);
        match self.io.read_buf(&mut self.read_buf).await {
            Ok(read) => Ok(read),
            Err(e) => {
                self.broken = true;
                Err(StratusError::transmission(e.to_string()))
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), StratusError> {
        if let Err(e) = self.io.write_all(data).await {
            self.broken = true;
            return Err(StratusError::transmission(e.to_string()));
        }
        Ok(())
    }

    async fn write_body(&mut self, mut body: ByteStream, chunked: bool) -> Result<(), StratusError> {
        let mut subscription = body.subscribe()?;
        while let Some(chunk) = subscription.pull().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.broken = true;
                    return Err(error);
                }
            };
            if chunked {
                self.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                self.write_all(&chunk).await?;
                self.write_all(b"\r\n").await?;
            } else {
                self.write_all(&chunk).await?;
            }
        }
        if chunked {
            self.write_all(b"0\r\n\r\n").await?;
        }
        Ok(())
    }

    async fn take_line(&mut self) -> Result<Bytes, StratusError> {
        loop {
            if let Some(end) = find_crlf(&self.read_buf) {
                let line = self.read_buf.split_to(end).freeze();
                self.read_buf.advance(2);
                return Ok(line);
            }
            if self.fill().await? == 0 {
                self.broken = true;
                return Err(StratusError::transmission("connection closed inside chunked body"));
            }
        }
    }

    async fn read_chunked(&mut self, state: ChunkState) -> Result<Option<Bytes>, StratusError> {
        let mut state = state;
        loop {
            match state {
                ChunkState::Size => {
                    let line = self.take_line().await?;
                    let size = parse_chunk_size(&line)?;
                    state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if self.read_buf.is_empty() && self.fill().await? == 0 {
                        self.broken = true;
                        return Err(StratusError::transmission("connection closed inside chunk"));
                    }
                    let take = clamp(remaining, self.read_buf.len());
                    let chunk = self.read_buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.framing = Framing::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(Some(chunk));
                }
                ChunkState::DataEnd => {
                    let line = self.take_line().await?;
                    if !line.is_empty() {
                        self.broken = true;
                        return Err(StratusError::decode("missing CRLF after chunk data"));
                    }
                    state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let line = self.take_line().await?;
                    if line.is_empty() {
                        self.framing = Framing::Done;
                        return Ok(None);
                    }
                }
            }
            self.framing = Framing::Chunked(state);
        }
    }
}

#[async_trait]
impl<S> Connection for H1Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<ByteStream>,
    ) -> Result<(), StratusError> {
        let chunked = body.is_some() && !head.headers.contains(names::CONTENT_LENGTH);
        let mut out = format!("{} {} HTTP/1.1\r\n", head.method, head.path);
        for (name, value) in head.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if chunked {
            out.push_str("Transfer-Encoding: chunked\r\n");
        }
        out.push_str("\r\n");

        self.method = Some(head.method);
        self.framing = Framing::Done;
        self.write_all(out.as_bytes()).await?;
        if let Some(body) = body {
            self.write_body(body, chunked).await?;
        }
        if let Err(e) = self.io.flush().await {
            self.broken = true;
            return Err(StratusError::transmission(e.to_string()));
        }
        trace!(method = %head.method, path = %head.path, chunked, "Request written");
        Ok(())
    }

    async fn read_response_head(&mut self) -> Result<ResponseHead, StratusError> {
        loop {
            let end = loop {
                if let Some(end) = find_head_end(&self.read_buf) {
                    break end;
                }
                if self.read_buf.len() > MAX_HEAD_SIZE {
                    self.broken = true;
                    return Err(StratusError::decode("response head too large"));
                }
                if self.fill().await? == 0 {
                    self.broken = true;
                    return Err(StratusError::transmission(
                        "connection closed before response head",
                    ));
                }
            };
            let raw = self.read_buf.split_to(end + 4);
            let parsed = match parse_head(&raw[..end]) {
                Ok(parsed) => parsed,
                Err(error) => {
                    self.broken = true;
                    return Err(error);
                }
            };
            if (100..200).contains(&parsed.head.status) && parsed.head.status != 101 {
                continue;
            }

            self.keep_alive = parsed.keep_alive;
            let no_body = self.method == Some(Method::Head) || matches!(parsed.head.status, 204 | 304);
            self.framing = if no_body {
                Framing::Done
            } else if parsed.chunked {
                Framing::Chunked(ChunkState::Size)
            } else {
                match parsed.head.headers.content_length() {
                    Some(0) => Framing::Done,
                    Some(length) => Framing::Length(length),
                    None => {
                        self.keep_alive = false;
                        Framing::UntilClose
                    }
                }
            };
            return Ok(parsed.head);
        }
    }

    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, StratusError> {
        match self.framing {
            Framing::Done => Ok(None),
            Framing::Length(remaining) => {
                if self.read_buf.is_empty() && self.fill().await? == 0 {
                    self.broken = true;
                    return Err(StratusError::transmission(format!(
                        "connection closed with {remaining} body bytes outstanding"
                    )));
                }
                let take = clamp(remaining, self.read_buf.len());
                let left = remaining - take as u64;
                self.framing = if left == 0 { Framing::Done } else { Framing::Length(left) };
                Ok(Some(self.read_buf.split_to(take).freeze()))
            }
            Framing::Chunked(state) => self.read_chunked(state).await,
            Framing::UntilClose => {
                if self.read_buf.is_empty() && self.fill().await? == 0 {
                    self.framing = Framing::Done;
                    return Ok(None);
                }
                Ok(Some(self.read_buf.split().freeze()))
            }
        }
    }

    fn is_reusable(&self) -> bool {
        self.keep_alive && !self.broken && self.framing == Framing::Done && self.read_buf.is_empty()
    }

    fn abort(&mut self) {
        self.broken = true;
        self.keep_alive = false;
        self.read_buf.clear();
    }

    async fn close(&mut self) {
        self.keep_alive = false;
        if let Err(e) = self.io.shutdown().await {
            trace!(error = %e, "Shutdown failed");
        }
    }
}

struct ParsedHead {
    head: ResponseHead,
    chunked: bool,
    keep_alive: bool,
}

fn parse_head(raw: &[u8]) -> Result<ParsedHead, StratusError> {
    let text = std::str::from_utf8(raw).map_err(|_| StratusError::decode("response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(StratusError::decode(format!("invalid status line: {status_line}")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| StratusError::decode(format!("invalid status line: {status_line}")))?;
    let status_text = parts.next().unwrap_or_default();

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StratusError::decode(format!("invalid header line: {line}")))?;
        headers.append(name.trim(), value.trim());
    }

    let chunked = headers
        .all(names::TRANSFER_ENCODING)
        .iter()
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    let connection = headers.first(names::CONNECTION).map(str::to_ascii_lowercase);
    let keep_alive = match connection.as_deref() {
        Some(value) if value.contains("close") => false,
        Some(value) if value.contains("keep-alive") => true,
        _ => version == "HTTP/1.1",
    };

    Ok(ParsedHead {
        head: ResponseHead::new(status, status_text, headers),
        chunked,
        keep_alive,
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, StratusError> {
    let text = std::str::from_utf8(line).map_err(|_| StratusError::decode("invalid chunk size line"))?;
    let hex = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(hex, 16).map_err(|_| StratusError::decode(format!("invalid chunk size: {hex}")))
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn clamp(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}
