//! `flagdb` is the core of a multi-tenant key-value store whose defining
//! feature is named-flag transactions with durable, ordered, multi-step
//! rollback. Clients group writes under a named *flag*; on commit, the
//! engine records enough prior-image information on disk that a later
//! operator can roll the committed flag back — and, recursively, roll back
//! earlier committed flags in reverse order — restoring exact byte-for-byte
//! prior values. [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use tempfile::TempDir;
//! use flagdb::dispatcher::Dispatcher;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> Result<(), flagdb::error::Error> {
//!     let dir = TempDir::new().unwrap();
//!     let db = Dispatcher::new(dir.path().to_path_buf())?;
//!
//!     db.set(1, b"tbName", b"key1", b"value1")?;
//!     assert_eq!(db.get(1, b"tbName", b"key1")?, b"value1");
//!
//!     db.open_flag(1, b"flag1")?;
//!     db.set_with_flag(1, b"flag1", b"tbName", b"key1", b"value2")?;
//!     db.commit(1, b"flag1")?;
//!     assert_eq!(db.get(1, b"tbName", b"key1")?, b"value2");
//!
//!     db.rollback(1, b"flag1")?;
//!     assert_eq!(db.get(1, b"tbName", b"key1")?, b"value1");
//!
//!     db.close();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod ops;
pub mod registry;
pub mod storage;
