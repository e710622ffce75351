//! # Ferry Core
//!
//! Shared building blocks for the ferry content pipeline: generational slot
//! tables, content digests, the content library with its manifest format,
//! the control-context scheduler and the traits the other crates plug into.

pub mod config;
pub mod digest;
pub mod error;
pub mod library;
pub mod scheduler;
pub mod slot;
pub mod traits;

pub mod prelude {
    pub use super::config::*;
    pub use super::digest::*;
    pub use super::error::*;
    pub use super::library::*;
    pub use super::scheduler::*;
    pub use super::slot::*;
    pub use super::traits::*;
}
