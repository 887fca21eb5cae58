//! Storage contract shared by every ocistash repository backend.
//!
//! A repository is a flat set of blobs addressed by [`Handle`]s. Backends
//! implement [`Backend`]; where a blob lands inside the remote key space is
//! decided by a [`KeyLayout`].

pub mod backend;
pub mod error;
pub mod handle;
pub mod layout;
pub mod reader;

pub use backend::{default_delete, default_load, Backend, ContentHasher, Consumer, Visitor};
pub use error::BackendError;
pub use handle::{FileInfo, FileType, Handle};
pub use layout::{DefaultLayout, KeyLayout, S3LegacyLayout};
pub use reader::{ByteReader, FileReader, RewindReader};
