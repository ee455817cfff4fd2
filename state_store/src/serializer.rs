use data_model::{ArtifactError, ArtifactRecord, ArtifactResult};

/// JSON row encoding for registry records. Decoding checks that the record
/// belongs to the row key it was read from.
pub struct RecordCodec;

impl RecordCodec {
    pub fn encode(record: &ArtifactRecord) -> ArtifactResult<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| {
            ArtifactError::Internal(format!(
                "error serializing artifact record {}: {}",
                record.id, e
            ))
        })
    }

    pub fn decode(row_key: &[u8], bytes: &[u8]) -> ArtifactResult<ArtifactRecord> {
        let record: ArtifactRecord = serde_json::from_slice(bytes).map_err(|e| {
            ArtifactError::Internal(format!(
                "error deserializing artifact record at {}: {}",
                String::from_utf8_lossy(row_key),
                e
            ))
        })?;
        if record.key().as_bytes() != row_key {
            return Err(ArtifactError::Internal(format!(
                "artifact record {} stored under foreign key {}",
                record.id,
                String::from_utf8_lossy(row_key)
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_key, ArtifactRecordBuilder, ArtifactStatus};

    use super::*;

    fn record(name: &str) -> ArtifactRecord {
        let key = mock_key(name);
        ArtifactRecordBuilder::default()
            .id(7u64)
            .scope(key.scope)
            .name(key.name)
            .status(ArtifactStatus::Pending)
            .build()
            .unwrap()
    }

    #[test]
    fn test_decode_checks_row_key() {
        let record = record("artifact");
        let bytes = RecordCodec::encode(&record).unwrap();
        let row_key = mock_key("artifact").key();

        let decoded = RecordCodec::decode(row_key.as_bytes(), &bytes).unwrap();
        assert_eq!(decoded, record);

        let foreign = mock_key("other").key();
        assert!(matches!(
            RecordCodec::decode(foreign.as_bytes(), &bytes),
            Err(ArtifactError::Internal(_))
        ));
        assert!(matches!(
            RecordCodec::decode(row_key.as_bytes(), b"{not json"),
            Err(ArtifactError::Internal(_))
        ));
    }
}
