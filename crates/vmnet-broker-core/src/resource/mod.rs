//! Named network resources and their lease counts.
//!
//! The [`ResourceManager`] is the only owner of network instances. Sessions
//! refer to networks by name and never hold an instance themselves.

pub mod manager;

pub use manager::{Acquire, Resolution, ResourceEvent, ResourceManager, ResourceState};
