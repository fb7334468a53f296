//! # sortheap-engine
//!
//! SortHeap: a table engine that keeps its rows sorted on disk.
//!
//! Inserts are buffered per transaction and dumped as sorted runs onto the
//! tapes of a TapeSet, following the polyphase distribution. A merge
//! folds every run of a TapeSet into a single result run; vacuum then
//! returns the old tapes to the allocator once no reader can see them.
//! Scans merge the visible runs of every TapeSet into one ordered stream,
//! seeking with each run's B-tree index and skipping block ranges whose
//! column summaries rule out the predicate.
//!
//! ```ignore
//! let heap = SortHeap::create(config, relation, schema, store, wal)?;
//! heap.load(rows)?;
//! heap.merge_once(true)?;
//! for row in heap.scan(ScanOptions::new())? {
//!     println!("{:?}", row?);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Status reports
pub mod diagnostics;

/// Insert buffering and run dumps
pub mod dump;

/// Engine errors
pub mod error;

/// Tuple formats
pub mod format;

/// The SortHeap façade
pub mod heap;

/// Relation metadata
pub mod meta;

/// Ordered scans
pub mod scan;

/// Multi-relation sessions
pub mod session;

/// TapeSet state
pub mod tapeset;

/// Background maintenance
pub mod worker;

mod kmerge;
mod merge;
mod recovery;
mod vacuum;

pub use diagnostics::{DiagnosticReport, TapeReport, TapeSetReport};
pub use dump::InsertBuffer;
pub use error::{EngineError, EngineResult};
pub use format::{CompressedFormat, PlainFormat, TupleFormat};
pub use heap::SortHeap;
pub use scan::{Bound, Scan, ScanOptions};
pub use session::{Session, SessionState};
pub use tapeset::TapeSetStatus;
pub use worker::{TaskHandle, TaskLauncher, ThreadLauncher, WorkerGuard};
