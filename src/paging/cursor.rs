//! Offset cursors: `base64("arrayconnection:" + offset)`.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::error::Error;

const PREFIX: &str = "arrayconnection:";

/// Encodes an offset cursor. Takes the same `i64` range [`decode`] returns,
/// so every encoded offset decodes to itself.
pub fn encode(offset: i64) -> String {
    STANDARD.encode(format!("{}{}", PREFIX, offset))
}

/// Decodes an offset cursor. Negative offsets come back as-is and offsets
/// out of `i64` range saturate, leaving range handling to the pager.
///
/// Anything that is not an offset cursor is a validation error at `path`.
/// Malformed cursors are never read as offset 0.
pub fn decode(cursor: &str, path: &str) -> Result<i64, Error> {
    let invalid = || Error::validation(path, "invalid cursor");

    let bytes = STANDARD.decode(cursor).map_err(|_| invalid())?;
    let text = String::from_utf8(bytes).map_err(|_| invalid())?;
    let number = text.strip_prefix(PREFIX).ok_or_else(invalid)?;

    if let Ok(offset) = number.parse::<i64>() {
        return Ok(offset);
    }
    let (negative, digits) = match number.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, number),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(if negative { i64::MIN } else { i64::MAX })
}
