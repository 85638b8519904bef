use common::{Metadata, headers};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

/// Current wall-clock time in unix milliseconds, the unit of `Timestamp` headers.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Name and schema version stamped on every outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub name: String,
    pub schema_version: String,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: schema_version.into(),
        }
    }
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self::new("product", "v1")
    }
}

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: Metadata,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            headers: Metadata::new(),
        }
    }

    /// JSON-encodes `payload` into a new envelope.
    pub fn json<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload).map_err(MessagingError::Encode)?;
        Ok(Self::new(topic, body))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header(headers::EVENT_ID)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.header(headers::TRACE_ID)
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.header(headers::PARTITION_KEY)
    }

    /// Publish time in unix milliseconds, if stamped.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.header(headers::TIMESTAMP)?.parse().ok()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|source| MessagingError::Decode {
            topic: self.topic.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        order_id: i64,
    }

    #[test]
    fn json_body_decodes_back() {
        let envelope = Envelope::json("t", &Ping { order_id: 3 }).unwrap();
        assert_eq!(envelope.decode::<Ping>().unwrap(), Ping { order_id: 3 });
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let envelope = Envelope::new("OnPaymentSuccess", b"not json".to_vec());
        let err = envelope.decode::<Ping>().unwrap_err();
        assert!(matches!(err, MessagingError::Decode { ref topic, .. } if topic == "OnPaymentSuccess"));
    }

    #[test]
    fn timestamp_header_parses_as_millis() {
        let envelope = Envelope::new("t", Vec::new()).with_header(headers::TIMESTAMP, "1700000000000");
        assert_eq!(envelope.timestamp_millis(), Some(1_700_000_000_000));
    }
}
