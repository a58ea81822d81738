//! Binary data encodings.
//!
//! Bincode is used for everything that crosses a process boundary: the
//! command envelope, execute responses, long-poll snapshot bodies, and the
//! meta.db snapshot file. JSON is used only where the HTTP surface requires
//! it (leases and meta-node join), and lives with those handlers.
pub mod bincode;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A bincode-encodable value, providing encode/decode convenience methods.
/// The encoding is deterministic for a given value, which the replicated
/// command envelope relies on.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader)
    }
}
