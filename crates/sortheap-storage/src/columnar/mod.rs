//! Column compression of same-key row groups.
//!
//! Sorted runs often hold long stretches of rows with equal sort keys. The
//! [`ColumnGrouper`] finds those stretches while a run is written and each
//! becomes one [`CompressedGroup`] tuple: the shared key followed by one
//! [`ColumnChunk`] per block of columns. Readers decode a group through
//! [`DecodedGroup`], which decodes only the chunks a projection needs.

mod chunk;
mod group;
mod grouper;

pub use chunk::{ChunkCodec, ChunkStorage, ColumnChunk};
pub use group::{CompressedGroup, DecodedGroup};
pub use grouper::{ColumnGrouper, GroupOutput};
