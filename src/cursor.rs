//! Opaque cursor encoding
//!
//! Externally a cursor is the base64 form of its raw text. The raw text is
//! either a bare value (offsets and single-column keyset cursors) or a JSON
//! object `{"values": {column: value, ...}}` for multi-column keyset cursors.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Map, Value};

/// Cursor encoding/decoding
pub struct CursorCodec;

impl CursorCodec {
    /// Encode cursor to base64
    pub fn encode(value: &str) -> String {
        BASE64.encode(value.as_bytes())
    }

    /// Decode cursor from base64
    pub fn decode(cursor: &str) -> crate::Result<String> {
        let bytes = BASE64
            .decode(cursor.as_bytes())
            .map_err(|e| crate::GraphQLError::InvalidCursor(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| crate::GraphQLError::InvalidCursor(e.to_string()))
    }
}

/// A position in an ordered result
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    /// Number of rows consumed so far
    Offset(u64),
    /// Bare value of the single cursor column
    Scalar(String),
    /// One value per cursor column
    Values(Map<String, Value>),
}

impl Cursor {
    /// Interpret decoded cursor text. Structured cursors are recognised by a
    /// `values` object; anything else is a bare scalar.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(mut object)) => match object.remove("values") {
                Some(Value::Object(values)) => Cursor::Values(values),
                _ => Cursor::Scalar(raw.to_string()),
            },
            _ => Cursor::Scalar(raw.to_string()),
        }
    }

    /// Decode an opaque cursor argument. Undecodable input is logged and
    /// treated as absent rather than failing the request.
    pub fn decode(encoded: &str) -> Option<Self> {
        match CursorCodec::decode(encoded) {
            Ok(raw) => Some(Self::parse(&raw)),
            Err(error) => {
                tracing::warn!(cursor = %encoded, error = %error, "ignoring undecodable cursor");
                None
            }
        }
    }

    /// Raw cursor text, before base64
    pub fn to_raw_string(&self) -> String {
        match self {
            Cursor::Offset(offset) => offset.to_string(),
            Cursor::Scalar(value) => value.clone(),
            Cursor::Values(values) => json!({ "values": values }).to_string(),
        }
    }

    /// Opaque form handed to clients
    pub fn encode(&self) -> String {
        CursorCodec::encode(&self.to_raw_string())
    }

    /// Value recorded for `column`. A bare scalar stands for whichever single
    /// column the cursor was produced for.
    pub fn value_for(&self, column: &str) -> Option<Value> {
        match self {
            Cursor::Offset(offset) => Some(Value::from(*offset)),
            Cursor::Scalar(value) => Some(Value::String(value.clone())),
            Cursor::Values(values) => values.get(column).cloned(),
        }
    }

    /// Offset-mode reading of the cursor; anything that is not a
    /// non-negative integer restarts from the beginning.
    pub fn as_offset(&self) -> u64 {
        match self {
            Cursor::Offset(offset) => *offset,
            Cursor::Scalar(value) => value.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(cursor = %value, "offset cursor is not an integer, starting at 0");
                0
            }),
            Cursor::Values(_) => {
                tracing::warn!("structured cursor used in offset mode, starting at 0");
                0
            }
        }
    }
}

/// Convert an offset window into `(page, page_size)`
pub fn offset_to_page(after: u64, first: u64) -> (u64, u64) {
    if first == 0 {
        return (0, 0);
    }
    (after / first, first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_codec() {
        let original = "test-cursor";
        let encoded = CursorCodec::encode(original);
        let decoded = CursorCodec::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_scalar_cursor_is_plain_base64() {
        let cursor = Cursor::Scalar("3".to_string());
        assert_eq!(cursor.encode(), "Mw==");
        assert_eq!(Cursor::decode("Mw=="), Some(cursor));
    }

    #[test]
    fn test_structured_cursor_keeps_column_order() {
        let mut values = Map::new();
        values.insert("value".to_string(), json!(20));
        values.insert("id".to_string(), json!(3));
        let cursor = Cursor::Values(values);

        assert_eq!(cursor.to_raw_string(), r#"{"values":{"value":20,"id":3}}"#);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded.value_for("id"), Some(json!(3)));
        assert_eq!(decoded.value_for("missing"), None);
    }

    #[test]
    fn test_json_without_values_is_a_scalar() {
        assert_eq!(Cursor::parse(r#"{"id":1}"#), Cursor::Scalar(r#"{"id":1}"#.to_string()));
        assert_eq!(Cursor::parse("42"), Cursor::Scalar("42".to_string()));
    }

    #[test]
    fn test_malformed_cursor_degrades() {
        assert_eq!(Cursor::decode("not base64!"), None);
        assert_eq!(Cursor::Scalar("abc".to_string()).as_offset(), 0);
        assert_eq!(Cursor::Scalar("4".to_string()).as_offset(), 4);
    }

    #[test]
    fn test_offset_to_page() {
        assert_eq!(offset_to_page(20, 10), (2, 10));
        assert_eq!(offset_to_page(15, 10), (1, 10));
        assert_eq!(offset_to_page(5, 0), (0, 0));
    }
}
