//! Persistence layer modules.

pub mod store;

pub use store::{load_doc, save_doc, FsStore, MemStore, StateStore};
