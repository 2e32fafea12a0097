//! Gamepad remapping core: per-device report pipeline, synthetic input
//! commit and wheel emulation, plus the collaborators that feed it.

pub mod config;
pub mod controller;
pub mod mapping;
pub mod persistence;
