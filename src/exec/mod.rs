//! Execution control
//!
//! Runs one command to completion under a timeout while a sampler thread
//! measures its process group.

pub mod executor;
pub mod sampler;
