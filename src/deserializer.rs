//! Hook for interpreting a record's raw bytes before it reaches the filter
//! chain and downstream consumer. Selected by configuration the same way
//! the retry policy and persistence adapter are; the engine itself treats
//! message payloads as opaque bytes and never assumes a specific wire
//! format, since schema resolution (Avro/Protobuf/registry lookups for
//! display) is out of scope here.

use async_trait::async_trait;

use crate::message::Record;

/// Transforms a raw [`Record`] into the byte payload handed to the filter
/// chain and, eventually, the caller via `next_tuple`.
#[async_trait]
pub trait Deserializer: Send + Sync {
    async fn deserialize(&self, record: &Record) -> crate::error::Result<Vec<u8>>;
}

/// Default: passes the raw bytes through unchanged.
#[derive(Default)]
pub struct IdentityDeserializer;

#[async_trait]
impl Deserializer for IdentityDeserializer {
    async fn deserialize(&self, record: &Record) -> crate::error::Result<Vec<u8>> {
        Ok(record.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_deserializer_passes_bytes_through() {
        let deserializer = IdentityDeserializer;
        let record = Record {
            namespace: "orders".into(),
            partition: 0,
            offset: 1,
            values: b"hello".to_vec(),
        };

        let out = deserializer.deserialize(&record).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
