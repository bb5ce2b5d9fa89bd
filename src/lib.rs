pub mod vli;
pub mod check;
pub mod filter;
pub mod block;
pub mod index;
pub mod stream;
pub mod writer;
pub mod reader;
pub mod seekable;
pub mod error;

mod count;

pub use check::CheckType;
pub use error::{as_xz_error, XzError};
pub use filter::{BcjKind, BcjOptions, DeltaOptions, Filter, Lzma2Options};
pub use writer::XzWriter;
pub use reader::XzReader;
pub use seekable::{BlockInfo, SeekableXzReader};
