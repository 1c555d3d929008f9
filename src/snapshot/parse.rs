//! Decoding of snapshot text frames.

use thiserror::Error;

use super::record::RawSnapshot;

/// Errors that can occur while decoding a snapshot frame.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("empty snapshot frame")]
    Empty,

    #[error("snapshot frame is not a JSON object")]
    NotAnObject,

    #[error("decoding snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Parse a text frame into a [`RawSnapshot`].
///
/// Identifier uniqueness is not checked here; duplicates are resolved by the
/// reconciler.
pub fn parse_snapshot(text: &str) -> Result<RawSnapshot, ParseError> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if !trimmed.starts_with('{') {
        return Err(ParseError::NotAnObject);
    }

    Ok(serde_json::from_str(trimmed)?)
}
