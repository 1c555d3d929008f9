pub mod parse;
pub mod record;

pub use self::parse::{parse_snapshot, ParseError};
pub use self::record::{ConnectionMetadata, ConnectionRecord, RawSnapshot};
