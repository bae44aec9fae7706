//! # foundry-protocol
//!
//! Machine data model and wire protocol for the foundry telemetry hub.
//!
//! This crate defines what travels between the server, control sources
//! and observers: machine records, update patches, the frames that carry
//! them, and the codecs for both wire encodings.
//!
//! ## Events
//!
//! - `request:machines` - Ask for the full machine list
//! - `machines:list` - Full registry snapshot
//! - `simulator:update` - Patch from a control source
//! - `machine:update` - Updated record fanned out to observers
//!
//! ## Example
//!
//! ```rust
//! use foundry_protocol::{codec, Frame, MachinePatch, MachineStatus};
//!
//! let patch = MachinePatch::new("machine-1").with_status(MachineStatus::Online);
//! let frame = Frame::simulator_update(patch);
//!
//! let text = codec::encode_json(&frame).unwrap();
//! assert_eq!(codec::decode_json(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod machine;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{error_codes, ErrorBody, Event, Frame};
pub use machine::{Actuators, Machine, MachineId, MachinePatch, MachineStatus, Sensors};
