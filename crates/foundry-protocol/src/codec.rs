//! Codecs for encoding and decoding foundry frames.
//!
//! Two encodings are supported:
//!
//! - **JSON**: one frame per text message, for browser observers.
//! - **MessagePack**: named MessagePack with a length prefix, for binary
//!   clients. Several frames may share one message and one frame may be
//!   split across messages.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Wire encoding of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text messages.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary messages.
    Msgpack,
}

impl Encoding {
    /// Name used in the `format` query parameter.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Msgpack => "msgpack",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::Msgpack),
            other => Err(ProtocolError::Invalid(format!("unknown encoding: {other}"))),
        }
    }
}

/// Encode a frame to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Parse the length prefix at the start of `data`.
///
/// Returns the total size of the first frame (prefix included), or `None`
/// if fewer than [`LENGTH_PREFIX_SIZE`] bytes are available.
fn frame_size(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut len = [0u8; LENGTH_PREFIX_SIZE];
    len.copy_from_slice(prefix);
    let length = u32::from_be_bytes(len) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(LENGTH_PREFIX_SIZE + length))
}

/// Decode a single frame from length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let total = frame_size(data)?.unwrap_or(LENGTH_PREFIX_SIZE);
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }
    check_numbers(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total])?)
}

/// Decode the next frame from a receive buffer.
///
/// Returns `Ok(None)` and leaves the buffer untouched while the frame is
/// still incomplete; a decoded frame is consumed from the buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid. A frame that
/// decodes but is rejected by validation is still consumed.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let total = match frame_size(buf)? {
        Some(total) if buf.len() >= total => total,
        _ => return Ok(None),
    };

    let frame = buf.split_to(total);
    check_numbers(rmp_serde::from_slice(&frame[LENGTH_PREFIX_SIZE..])?).map(Some)
}

/// Reject patches that MessagePack can carry but JSON cannot.
fn check_numbers(frame: Frame) -> Result<Frame, ProtocolError> {
    if let Frame::SimulatorUpdate(patch) = &frame {
        if let Some((sensor, value)) = patch.non_finite_sensor() {
            return Err(ProtocolError::Invalid(format!(
                "sensor {sensor} of {} is not a finite number ({value})",
                patch.machine_id
            )));
        }
    }
    Ok(frame)
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is not a valid frame.
pub fn decode_json(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachinePatch, MachineStatus};

    fn sample_machine() -> Machine {
        let mut machine = Machine::new("machine-1", "Conveyor 01", "Smart Conveyor")
            .with_sensor("temperature", 72.25)
            .with_sensor("speed", 1200.0)
            .with_actuator("motor", true);
        machine.status = MachineStatus::Online;
        machine.last_update = Some(1_700_000_000_123);
        machine
    }

    #[test]
    fn test_msgpack_frames_decode_to_originals() {
        let frames = vec![
            Frame::request_machines(),
            Frame::machines_list(vec![sample_machine()]),
            Frame::machine_update(sample_machine()),
            Frame::simulator_update(MachinePatch::terminal(&sample_machine())),
            Frame::error(1001, "Invalid frame"),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_json_wire_shape() {
        let text = encode_json(&Frame::machine_update(sample_machine())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "machine:update");
        assert_eq!(value["data"]["id"], "machine-1");
        assert_eq!(value["data"]["lastUpdate"], 1_700_000_000_123u64);

        assert_eq!(decode_json(&text).unwrap(), Frame::machine_update(sample_machine()));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::machine_update(sample_machine())).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_from(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::request_machines();
        let frame2 = Frame::simulator_update(MachinePatch::new("machine-3"));

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // Hold back the last byte so the second frame is split.
        let tail = buf.split_off(buf.len() - 1);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame1));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.unsplit(tail);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(frame2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_non_finite_sensor_rejected() {
        let sensors = [("temperature".to_string(), f64::INFINITY)].into_iter().collect();
        let frame = Frame::simulator_update(MachinePatch::new("machine-1").with_sensors(sensors));
        let encoded = encode(&frame).unwrap();

        assert!(matches!(decode(&encoded), Err(ProtocolError::Invalid(_))));

        let mut buf = BytesMut::from(&encoded[..]);
        encode_into(&Frame::request_machines(), &mut buf).unwrap();
        assert!(matches!(decode_from(&mut buf), Err(ProtocolError::Invalid(_))));
        // The rejected frame is consumed and the stream stays aligned.
        assert_eq!(decode_from(&mut buf).unwrap(), Some(Frame::RequestMachines));
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("MsgPack".parse::<Encoding>().unwrap(), Encoding::Msgpack);
        assert!("xml".parse::<Encoding>().is_err());
    }
}
