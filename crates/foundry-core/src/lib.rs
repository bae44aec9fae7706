//! # foundry-core
//!
//! Machine registry and broadcast hub for the foundry telemetry server.
//!
//! - **Registry** - Authoritative machine records and patch application
//! - **Catalog** - The fixed seed catalog
//! - **Hub** - Single-writer task that serializes every registry operation
//!   and fans updates out to observers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  apply   ┌─────────────┐  machine:update  ┌─────────────┐
//! │   Control   │─────────▶│     Hub     │─────────────────▶│  Observers  │
//! └─────────────┘          └─────────────┘                  └─────────────┘
//!                                 │
//!                                 ▼
//!                          ┌─────────────┐
//!                          │  Registry   │
//!                          └─────────────┘
//! ```

pub mod catalog;
pub mod hub;
pub mod registry;

pub use catalog::seed_machines;
pub use hub::{
    Applied, Hub, HubError, HubHandle, HubStats, ObserverId, ObserverReceiver, DEFAULT_QUEUE_CAPACITY,
};
pub use registry::{now_millis, MachineRegistry, RegistryError};
