//! # Plenum Wire
//! The serialization boundary of the plenum runtime. Every value that
//! crosses the transport — envelopes, system messages, user payloads,
//! migrated elements — implements [`Wire`].

mod error;
mod impls;
mod reader;
mod writer;

pub use error::WireErr;
pub use reader::ByteReader;
pub use writer::ByteWriter;

/// A type that can be written to and read back from a byte stream.
///
/// Encoding is little-endian and self-delimiting: a reader positioned at
/// the start of an encoded value consumes exactly the bytes the writer
/// produced for it.
pub trait Wire: Sized {
    fn ser(&self, writer: &mut ByteWriter);
    fn de(reader: &mut ByteReader) -> Result<Self, WireErr>;
}

/// A [`Wire`] type whose encoding occupies the same number of bytes for
/// every value. Required wherever byte offsets are computed from element
/// counts (one-sided windows).
pub trait FixedWire: Wire {
    const BYTES: usize;
}

/// Serializes a value into a fresh buffer.
pub fn to_bytes<T: Wire>(value: &T) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    value.ser(&mut writer);
    writer.into_bytes()
}

/// Deserializes a value from a buffer, requiring the buffer to be fully
/// consumed.
pub fn from_bytes<T: Wire>(bytes: &[u8]) -> Result<T, WireErr> {
    let mut reader = ByteReader::new(bytes);
    let value = T::de(&mut reader)?;
    if !reader.is_empty() {
        return Err(WireErr::TrailingBytes {
            remaining: reader.remaining(),
        });
    }
    Ok(value)
}
