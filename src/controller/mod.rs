//! Controller subsystem: report model and gamepad report source
//!
//! 1. [`report`] - Per-tick report model shared with the mapping core
//! 2. [`event_collector`] - gilrs polling into per-device snapshots
//! 3. [`controller_handle`] - Unified API and lifecycle management
//!
//! # Architecture
//!
//! ```text
//! Gamepads ──► Collector ──► DeviceReport ──► MappingEngineManager
//!                  │
//!                  └──► ManagerCommand::Release (on disconnect)
//! ```

pub mod controller_handle;
pub mod event_collector;
pub mod report;
