//! On-disk B+tree index engine: a fixed-width-key, fixed-width-item
//! ordered index over a block-addressed buffer cache, suitable for a
//! user-space filesystem's directory and metadata indices.
//!
//! `Tree<C, K>` is the single entry point most callers need; it wraps the
//! lower-level codec, allocator and cache modules behind `create`/`open`/
//! `search`/`insert`/`update`/`remove`/`range`/`close`.

pub mod allocator;
pub mod cache;
pub mod codec;
pub mod error;
pub mod key;
pub mod layout;
pub mod tree;

pub use cache::{BufferCache, MemCache, MmapCache};
pub use error::{IndexError, Result};
pub use key::{HashKey16, HashKey20, HashKey32, HashKey8, IntegerKey, Key};
pub use layout::{DEFAULT_CLUSTER_SIZE, MAX_STACK};
pub use tree::{InsertOutcome, RangeIter, StructureReport, Tree, TreeConfig, UpdatePolicy};
