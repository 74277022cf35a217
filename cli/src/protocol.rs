// Wire Protocol
//
// A request is one UTF-8 command line, read with a single read. A
// response is an 8-byte header (u32 LE error flag, u32 LE payload length)
// followed by the UTF-8 payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unterminated {0} quote in command")]
    UnterminatedQuote(char),

    #[error("message is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("invalid error flag {0}")]
    InvalidFlag(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub is_error: bool,
    pub payload: String,
}

impl Response {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            is_error: false,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            is_error: true,
            payload: payload.into(),
        }
    }

    /// The length field counts payload bytes, not characters. A payload
    /// too long for the length field is answered with an error instead.
    pub fn encode(&self) -> Bytes {
        self.encode_within(u32::MAX)
    }

    fn encode_within(&self, max_len: u32) -> Bytes {
        let payload = self.payload.as_bytes();
        match u32::try_from(payload.len()) {
            Ok(len) if len <= max_len => frame(self.is_error, len, payload),
            _ => {
                tracing::warn!(bytes = payload.len(), "response payload too large");
                let message = format!(
                    "response of {} bytes exceeds the {max_len} byte frame limit",
                    payload.len()
                );
                let len = u32::try_from(message.len()).unwrap_or(u32::MAX);
                frame(true, len, message.as_bytes())
            }
        }
    }
}

fn frame(is_error: bool, len: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(u32::from(is_error));
    buf.put_u32_le(len);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a command line into arguments.
///
/// Whitespace separates words. Single quotes keep their contents
/// literally; inside double quotes and bare words a backslash escapes the
/// next character. Quoted and bare pieces without whitespace between them
/// join into one argument.
pub fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ProtocolError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(ProtocolError::UnterminatedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(ProtocolError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }

    if in_arg {
        args.push(current);
    }
    Ok(args)
}

/// Read one request with a single read of at most `max_bytes`.
/// Returns `None` when the peer closed without sending anything.
pub async fn read_request<R>(reader: &mut R, max_bytes: usize) -> Result<Option<String>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max_bytes];
    let read = reader.read(&mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    buf.truncate(read);
    Ok(Some(String::from_utf8(buf)?))
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_response<R>(reader: &mut R) -> Result<Response, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let mut header = &header[..];
    let flag = header.get_u32_le();
    let len = header.get_u32_le() as usize;

    let is_error = match flag {
        0 => false,
        1 => true,
        other => return Err(ProtocolError::InvalidFlag(other)),
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Response {
        is_error,
        payload: String::from_utf8(payload)?,
    })
}

/// Send one command to a server and wait for its response.
pub async fn send(address: &str, command: &str) -> Result<Response, ProtocolError> {
    let mut stream = TcpStream::connect(address).await?;
    stream.write_all(command.as_bytes()).await?;
    stream.flush().await?;
    read_response(&mut stream).await
}
