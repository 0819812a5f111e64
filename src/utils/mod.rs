//! Utilities
//!
//! Hashing, tree walks, diff rendering, environment hygiene, bounded output
//! collection and the retry combinator.

pub mod diff;
pub mod env_hygiene;
pub mod hashing;
pub mod output;
pub mod retry;
pub mod tree;
