//! kubersync core library: domain types, local tree snapshots, errors.
//!
//! Public API surface:
//! - [`types`]: object identity and the keyed byte-map both stores share
//! - [`error`]: [`TreeError`]
//! - [`tree`]: recursive walk / snapshot of the mirrored directory

pub mod error;
pub mod tree;
pub mod types;

pub use error::TreeError;
pub use types::{Entries, ObjectRef, RemoteObject};
