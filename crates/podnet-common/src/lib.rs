//! # podnet-common
//!
//! Shared types for the podnet networking core.
//!
//! This crate provides:
//! - The error taxonomy used by every provisioning step
//! - Pod identifiers and the values derived from them
//! - Default host paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{PodnetError, PodnetResult};
pub use id::PodId;
pub use paths::NetPaths;
