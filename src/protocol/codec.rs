//! `Content-Length: N\r\n\r\n{json}` framing for the service's stdio channel.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Message, ProtocolError};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Headers larger than this without a terminator are treated as garbage.
const MAX_HEADER_LEN: usize = 8 * 1024;
/// Largest body accepted from the service.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;
/// Upper bound on a single reservation while a body is incomplete.
const RESERVE_STEP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body(usize),
}

#[derive(Debug)]
pub struct LspCodec {
    state: DecodeState,
}

impl Default for LspCodec {
    fn default() -> Self {
        Self { state: DecodeState::Header }
    }
}

impl Decoder for LspCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let end = match find_terminator(src) {
                        Some(end) => end,
                        None if src.len() > MAX_HEADER_LEN => {
                            return Err(ProtocolError::InvalidHeader(format!(
                                "no header terminator within {} bytes",
                                MAX_HEADER_LEN
                            )))
                        }
                        None => return Ok(None),
                    };
                    let length = parse_content_length(&src[..end])?;
                    src.advance(end + HEADER_TERMINATOR.len());
                    self.state = DecodeState::Body(length);
                }
                DecodeState::Body(length) => {
                    if src.len() < length {
                        src.reserve((length - src.len()).min(RESERVE_STEP));
                        return Ok(None);
                    }
                    let body = src.split_to(length);
                    self.state = DecodeState::Header;
                    return Ok(Some(serde_json::from_slice(&body)?));
                }
            }
        }
    }
}

impl Encoder<Message> for LspCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(&item)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

fn find_terminator(src: &[u8]) -> Option<usize> {
    src.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Other headers (`Content-Type`) are accepted and ignored.
fn parse_content_length(header: &[u8]) -> Result<usize, ProtocolError> {
    let header = std::str::from_utf8(header)
        .map_err(|e| ProtocolError::InvalidHeader(e.to_string()))?;

    let mut length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::InvalidHeader(line.to_string()));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|e| ProtocolError::InvalidHeader(format!("{}: {}", line, e)))?;
            if parsed > MAX_BODY_LEN {
                return Err(ProtocolError::InvalidHeader(format!(
                    "Content-Length {} exceeds limit of {} bytes",
                    parsed, MAX_BODY_LEN
                )));
            }
            length = Some(parsed);
        }
    }
    length.ok_or(ProtocolError::MissingContentLength)
}
