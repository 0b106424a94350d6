//! Shared framing for RTSP requests and responses.
//!
//! Both message kinds share the same shape after the start line:
//!
//! ```text
//! start-line CRLF
//! *(field-name ":" field-value CRLF)
//! CRLF
//! [Content-Length bytes of body]
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{NvrError, ParseErrorKind, Result};
use crate::protocol::header::Headers;

/// Upper bound on a declared body. RTSP bodies are SDP or parameter text.
pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Upper bound on a start line or header line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Upper bound on header lines in one message, continuations included.
pub const MAX_HEADER_LINES: usize = 256;

/// Read one line without its line terminator.
///
/// Returns `Ok(None)` if the stream ended before any byte was read. At most
/// [`MAX_LINE_LENGTH`] bytes plus the terminator are buffered.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&b'\n') {
        if raw.len() as u64 >= limit {
            return Err(NvrError::parse(ParseErrorKind::LineTooLong));
        }
        // Closed in the middle of a line.
        return Err(NvrError::UnexpectedEndOfStream);
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    if raw.len() > MAX_LINE_LENGTH {
        return Err(NvrError::parse(ParseErrorKind::LineTooLong));
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| NvrError::parse(ParseErrorKind::InvalidEncoding))
}

/// Read the start line of the next message.
///
/// A clean close before the first byte is [`NvrError::EndOfStream`].
pub(crate) async fn read_start_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader).await?.ok_or(NvrError::EndOfStream)
}

/// Read a MIME-style header block up to and including the empty line.
pub(crate) async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    for _ in 0..=MAX_HEADER_LINES {
        let line = read_line(reader)
            .await?
            .ok_or(NvrError::UnexpectedEndOfStream)?;
        if line.is_empty() {
            return Ok(headers);
        }

        if line.starts_with([' ', '\t']) {
            if !headers.continue_last(line.trim()) {
                return Err(NvrError::parse(ParseErrorKind::InvalidHeader));
            }
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or(NvrError::parse(ParseErrorKind::InvalidHeader))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(NvrError::parse(ParseErrorKind::InvalidHeader));
        }
        headers.append(name, value.trim());
    }
    Err(NvrError::parse(ParseErrorKind::TooManyHeaders))
}

/// Declared body length. A missing header means zero.
pub(crate) fn content_length(headers: &Headers) -> Result<usize> {
    let Some(raw) = headers.get("Content-Length") else {
        return Ok(0);
    };
    let invalid = || NvrError::parse(ParseErrorKind::InvalidContentLength(raw.to_string()));
    let length: usize = raw.trim().parse().map_err(|_| invalid())?;
    if length > MAX_CONTENT_LENGTH {
        return Err(invalid());
    }
    Ok(length)
}

/// Read exactly the declared body, leaving any following bytes unconsumed.
pub(crate) async fn read_body<R>(reader: &mut R, headers: &Headers) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let length = content_length(headers)?;
    let mut body = vec![0u8; length];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NvrError::UnexpectedEndOfStream)
        }
        Err(e) => Err(e.into()),
    }
}
