//! Persistence module.
//!
//! Provides the replace-set SQLite store, the bounded file archive, and a
//! lazily opened wrapper for either.

mod archive;
mod lazy;
mod models;
mod sink;
mod store;

pub use archive::*;
pub use lazy::*;
pub use models::*;
pub use sink::*;
pub use store::*;
