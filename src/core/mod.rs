//! Registry internals, leaf modules first

pub mod error;
pub mod validation;
pub mod version;
pub mod retry;
pub mod path;
pub mod storage;
pub mod codec;
pub mod card;
pub mod tracking;
pub mod allocator;
pub mod config;
pub mod registry;

pub use registry::CardRegistry;
