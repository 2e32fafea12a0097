//! Real-time input mapping and synthesis core
//!
//! Every device runs the same per-report pipeline on its own engine thread:
//!
//! ```text
//! DeviceReport ──► AxisShaper ──► ControlRemapper ──► SpecialActionEngine
//!                                                            │
//!     MappedState ◄── WheelEmulation ◄───────────────────────┘
//!                          │
//!                          └──► SyntheticStateCommitter (shared) ──► InputSink
//! ```
//!
//! The committer is the only state shared between devices.

pub mod axis_shaper;
pub mod binding;
pub mod controls;
pub mod curve;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod macro_player;
pub mod manager;
pub mod remapper;
pub mod special_action;
pub mod synthetic;
pub mod wheel;

pub use axis_shaper::{AxisConfig, AxisShaper};
pub use binding::BindingTable;
pub use engine::{DeviceEngineHandle, DeviceMapper, MapperDeps};
pub use error::MappingError;
pub use manager::{ManagerCommand, MappingEngineManager};
pub use special_action::SpecialAction;
pub use synthetic::SyntheticStateCommitter;
pub use wheel::WheelConfig;

use std::sync::Arc;

/// Runtime profile, resolved once from its persisted form
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub axis: AxisConfig,
    pub bindings: Arc<BindingTable>,
    pub actions: Arc<[SpecialAction]>,
    pub wheel: WheelConfig,
}

impl Profile {
    /// Profile without bindings or actions; every control passes through
    pub fn passthrough(name: &str) -> Self {
        Self {
            name: name.to_string(),
            axis: AxisConfig::default(),
            bindings: Arc::new(BindingTable::default()),
            actions: Arc::from(Vec::new()),
            wheel: WheelConfig::default(),
        }
    }
}

/// Profile collaborator
pub trait ProfileStore: Send + Sync {
    fn load_profile(&self, name: &str) -> Result<Profile, MappingError>;
}
