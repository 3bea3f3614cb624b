//! [`ScanCode`] – parser for the drum barcode printed on labels.
//!
//! Labels encode `<orderId>-H<drumId>`, optionally followed by whitespace and
//! a `YYYY/MM/DD HH:MM:SS` print timestamp:
//!
//! ```
//! use scanbridge_types::ScanCode;
//!
//! let code = ScanCode::parse("52-H1024 2024/01/22 08:31:59").unwrap();
//! assert_eq!(code.order_id, 52);
//! assert_eq!(code.drum_id, 1024);
//! assert!(code.printed_at.is_some());
//! ```
//!
//! The link layer never calls this; it is for consumers of the scan feed.

use chrono::NaiveDateTime;

use crate::BridgeError;

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// A decoded drum label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCode {
    pub order_id: u32,
    pub drum_id: u32,
    pub printed_at: Option<NaiveDateTime>,
}

impl ScanCode {
    /// Parse a trimmed scan payload.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Parsing`] when the payload does not match the
    /// label format.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let raw = raw.trim();
        let (code, rest) = match raw.find(char::is_whitespace) {
            Some(idx) => (&raw[..idx], raw[idx..].trim_start()),
            None => (raw, ""),
        };

        let (order, drum) = code
            .split_once("-H")
            .ok_or_else(|| BridgeError::Parsing(format!("'{raw}' is not an <order>-H<drum> code")))?;

        let order_id = parse_digits(order, "order id", raw)?;
        let drum_id = parse_digits(drum, "drum id", raw)?;

        let printed_at = if rest.is_empty() {
            None
        } else {
            Some(
                NaiveDateTime::parse_from_str(rest, TIMESTAMP_FORMAT)
                    .map_err(|e| BridgeError::Parsing(format!("bad timestamp in '{raw}': {e}")))?,
            )
        };

        Ok(Self {
            order_id,
            drum_id,
            printed_at,
        })
    }
}

fn parse_digits(part: &str, what: &str, raw: &str) -> Result<u32, BridgeError> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BridgeError::Parsing(format!("bad {what} in '{raw}'")));
    }
    part.parse::<u32>()
        .map_err(|e| BridgeError::Parsing(format!("bad {what} in '{raw}': {e}")))
}
