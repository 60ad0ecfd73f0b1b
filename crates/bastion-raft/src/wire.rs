//! Replicated wire format.
//!
//! `LogData` is the payload of one raft log entry: an ordered sequence of
//! `LogOperation`s forming the replicated atomicity unit. The encoding is
//! protobuf (varint-length-prefixed fields); there is no version field, so
//! forward compatibility is achieved only by additive extension. The records
//! persisted in the state machine's `latest` and `config` tables use the
//! same encoding.

use prost::Message;

/// Delete the key.
pub const OP_DELETE: u32 = 1;
/// Write the value under the key.
pub const OP_PUT: u32 = 2;
/// Run the registered restore callback; carries no data.
pub const OP_RESTORE_CALLBACK: u32 = 4;
/// Read the key back into the apply response; leader-side only.
pub const OP_GET: u32 = 8;
/// Log-verifier checkpoint marker; a state-machine no-op.
pub const OP_VERIFIER_CHECKPOINT: u32 = 16;

/// One serialized mutation inside a raft log entry.
#[derive(Clone, PartialEq, Message)]
pub struct LogOperation {
    /// One of the `OP_*` values. Unknown values fail apply.
    #[prost(uint32, tag = "1")]
    pub op_type: u32,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

impl LogOperation {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op_type: OP_PUT,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op_type: OP_DELETE,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Payload of one raft log entry.
#[derive(Clone, PartialEq, Message)]
pub struct LogData {
    #[prost(message, repeated, tag = "1")]
    pub operations: Vec<LogOperation>,
}

impl LogData {
    pub fn single(op: LogOperation) -> Self {
        Self { operations: vec![op] }
    }

    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

/// Last applied index and term, persisted in the `latest` table on every
/// apply so a restarting node can answer "what is my committed state?"
/// before raft re-establishes leadership.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct IndexValue {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
}

/// One server of the committed raft configuration.
#[derive(Clone, PartialEq, Message)]
pub struct ConfiguredServer {
    /// 0 = voter, 1 = non-voter.
    #[prost(int32, tag = "1")]
    pub suffrage: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub address: String,
}

/// The committed raft configuration as observed by the state machine.
#[derive(Clone, PartialEq, Message)]
pub struct ConfigurationValue {
    /// Log index at which this configuration was installed.
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(message, repeated, tag = "2")]
    pub servers: Vec<ConfiguredServer>,
}

pub const SUFFRAGE_VOTER: i32 = 0;
pub const SUFFRAGE_NON_VOTER: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_data_encoding_is_protobuf() {
        let data = LogData::single(LogOperation {
            op_type: OP_PUT,
            key: "a".to_string(),
            value: vec![0x01],
        });
        // field 1 (LogOperation message), inner fields: op_type varint,
        // key and value length-prefixed.
        let expected = [
            0x0a, 0x08, // LogData.operations, 8 bytes
            0x08, 0x02, // op_type = 2
            0x12, 0x01, 0x61, // key = "a"
            0x1a, 0x01, 0x01, // value = [1]
        ];
        assert_eq!(data.encode_bytes(), expected);
    }

    #[test]
    fn log_data_roundtrip() {
        let data = LogData {
            operations: vec![
                LogOperation::put("secret/foo", b"zork".to_vec()),
                LogOperation::delete("secret/bar"),
            ],
        };
        let decoded = LogData::decode_bytes(&data.encode_bytes()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn empty_log_data_is_empty_bytes() {
        // Verifier checkpoints replicate as empty payloads; decoding an empty
        // buffer must yield an empty operation list, not an error.
        let decoded = LogData::decode_bytes(&[]).unwrap();
        assert!(decoded.operations.is_empty());
    }

    #[test]
    fn index_value_roundtrip() {
        let latest = IndexValue { term: 3, index: 42 };
        let decoded = IndexValue::decode(latest.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, latest);
    }
}
