//! # foundry-transport
//!
//! Transport abstraction layer for foundry clients.
//!
//! Control sources and observers talk to the server through the
//! [`Connection`] trait; the WebSocket implementation is the default.
//!
//! ```rust,ignore
//! use foundry_transport::{Connection, WebSocketConfig, WebSocketConnection};
//!
//! let mut conn = WebSocketConnection::connect(&WebSocketConfig::new(url)).await?;
//! while let Some(frame) = conn.recv().await? {
//!     // Process frame
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
