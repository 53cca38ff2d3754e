//! File system plumbing shared by backup, restore, audit and migration.

pub mod atomic;
pub mod layout;
pub mod lock;
pub mod walker;

pub use atomic::{AtomicWriter, WriteMode};
pub use layout::StorageLayout;
pub use lock::WorkspaceLock;
