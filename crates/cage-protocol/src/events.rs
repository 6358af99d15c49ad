//! Control-path events and their on-stream framing.
//!
//! The output channel of a tty session interleaves raw terminal bytes with
//! structured lifecycle events. An event frame is a NUL tag byte, a u32
//! big-endian payload length, then the JSON payload. The engine keeps bare
//! NUL bytes out of raw output chunks, so the tag is unambiguous.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag byte introducing an event frame on the control path.
pub const EVENT_TAG: u8 = 0x00;

/// Length of the frame header (tag + u32 payload length).
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound on an event payload. Anything larger is a corrupt stream.
pub const MAX_EVENT_LEN: usize = 64 * 1024;

/// Structured events carried on the control path.
///
/// `resize` flows client to engine, `exit` flows engine to client. A bare
/// close of the channel signals "server-close-connection".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum ControlEvent {
    Resize { columns: u16, rows: u16 },
    Exit { code: i32 },
}

/// Errors raised while framing or deframing the control path.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("event payload of {0} bytes exceeds the {MAX_EVENT_LEN} byte limit")]
    Oversize(usize),

    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event into a single control-path frame.
pub fn encode_event(event: &ControlEvent) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(event)?;
    if payload.len() > MAX_EVENT_LEN {
        return Err(FrameError::Oversize(payload.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(EVENT_TAG);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// One decoded item from the control path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Raw terminal output bytes.
    Data(Vec<u8>),
    /// A structured event frame.
    Event(ControlEvent),
}

/// Incremental decoder for the control path. Frames may arrive split across
/// arbitrarily many reads; raw bytes are released as soon as they are known
/// not to belong to a frame.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk read from the channel, appending decoded items to
    /// `out`. Returns an error only on a corrupt stream; the decoder is not
    /// usable afterwards.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Decoded>) -> Result<(), FrameError> {
        self.buf.extend_from_slice(chunk);
        loop {
            if self.buf.is_empty() {
                return Ok(());
            }
            match self.buf.iter().position(|&b| b == EVENT_TAG) {
                None => {
                    out.push(Decoded::Data(std::mem::take(&mut self.buf)));
                    return Ok(());
                }
                Some(0) => {
                    if self.buf.len() < FRAME_HEADER_LEN {
                        return Ok(());
                    }
                    let len = u32::from_be_bytes([
                        self.buf[1],
                        self.buf[2],
                        self.buf[3],
                        self.buf[4],
                    ]) as usize;
                    if len > MAX_EVENT_LEN {
                        return Err(FrameError::Oversize(len));
                    }
                    if self.buf.len() < FRAME_HEADER_LEN + len {
                        return Ok(());
                    }
                    let payload = &self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
                    let event: ControlEvent = serde_json::from_slice(payload)?;
                    out.push(Decoded::Event(event));
                    self.buf.drain(..FRAME_HEADER_LEN + len);
                }
                Some(n) => {
                    let data: Vec<u8> = self.buf.drain(..n).collect();
                    out.push(Decoded::Data(data));
                }
            }
        }
    }
}
