use serde::{Deserialize, Serialize};

use crate::errors::TokenizeError;

/// Where a record came from. Used for log lines and for acknowledging source positions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrigin {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A single raw text message as delivered by an ingestion source.
///
/// The payload is opaque bytes; it only has to be UTF-8 once a tokenizer looks at it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub payload: Vec<u8>,
    pub origin: Option<RecordOrigin>,
}

impl Record {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            origin: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        self.origin = Some(RecordOrigin {
            topic: topic.into(),
            partition,
            offset,
        });
        self
    }

    /// Borrow the payload as text.
    ///
    /// # Errors
    /// Returns [`TokenizeError::InvalidUtf8`] when the payload is not UTF-8.
    pub fn text(&self) -> Result<&str, TokenizeError> {
        std::str::from_utf8(&self.payload).map_err(|e| TokenizeError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })
    }

    /// Short human-readable location for log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.origin {
            Some(o) => format!("{}[{}]@{}", o.topic, o.partition, o.offset),
            None => format!("<{} bytes>", self.payload.len()),
        }
    }
}

impl From<&str> for Record {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for Record {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}
