//! In-memory queue stores and fixtures for exercising qbench without a
//! database or stream server.
//!
//! Stores are cheap handles over shared state: clone one per worker to give
//! every worker its "own connection" to the same queue, exactly as the live
//! clients do.

pub mod fixtures;
pub mod mock;
pub mod row;
pub mod stream;

pub use fixtures::*;
pub use mock::*;
pub use row::InMemoryRowStore;
pub use stream::InMemoryStreamStore;
