use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::epoch::Epoch;
use crate::types::ClassId;

/// Identity of a logical reducer instance. Every reduction runs inside
/// exactly one scope; state for different scopes never interacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceScope {
    /// Reductions over an object group
    ObjGroup(ClassId),
    /// Reductions over a (virtual) collection proxy
    Collection(ClassId),
    /// Reductions over an explicitly registered group
    Group(u64),
    /// Reductions owned by a runtime component
    Component(u32),
    /// User-chosen scope
    UserId(u64),
}

/// Identity of one reduction within a scope. Two reductions with the same
/// scope but different stamps are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceStamp {
    Tag(u64),
    TagPair(u64, u64),
    /// Monotonically generated per scope; the default when the caller
    /// passes no stamp
    Seq(u64),
    UserId(u64),
    Epoch(Epoch),
}

impl Wire for ReduceScope {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            ReduceScope::ObjGroup(class) => {
                writer.write_byte(0);
                class.ser(writer);
            }
            ReduceScope::Collection(class) => {
                writer.write_byte(1);
                class.ser(writer);
            }
            ReduceScope::Group(id) => {
                writer.write_byte(2);
                id.ser(writer);
            }
            ReduceScope::Component(id) => {
                writer.write_byte(3);
                id.ser(writer);
            }
            ReduceScope::UserId(id) => {
                writer.write_byte(4);
                id.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(ReduceScope::ObjGroup(ClassId::de(reader)?)),
            1 => Ok(ReduceScope::Collection(ClassId::de(reader)?)),
            2 => Ok(ReduceScope::Group(u64::de(reader)?)),
            3 => Ok(ReduceScope::Component(u32::de(reader)?)),
            4 => Ok(ReduceScope::UserId(u64::de(reader)?)),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "ReduceScope",
            }),
        }
    }
}

impl Wire for ReduceStamp {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            ReduceStamp::Tag(tag) => {
                writer.write_byte(0);
                tag.ser(writer);
            }
            ReduceStamp::TagPair(first, second) => {
                writer.write_byte(1);
                first.ser(writer);
                second.ser(writer);
            }
            ReduceStamp::Seq(seq) => {
                writer.write_byte(2);
                seq.ser(writer);
            }
            ReduceStamp::UserId(id) => {
                writer.write_byte(3);
                id.ser(writer);
            }
            ReduceStamp::Epoch(epoch) => {
                writer.write_byte(4);
                epoch.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(ReduceStamp::Tag(u64::de(reader)?)),
            1 => Ok(ReduceStamp::TagPair(u64::de(reader)?, u64::de(reader)?)),
            2 => Ok(ReduceStamp::Seq(u64::de(reader)?)),
            3 => Ok(ReduceStamp::UserId(u64::de(reader)?)),
            4 => Ok(ReduceStamp::Epoch(Epoch::de(reader)?)),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "ReduceStamp",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plenum_wire::{from_bytes, to_bytes};

    #[test]
    fn scope_and_stamp_round_trip() {
        let scopes = [
            ReduceScope::ObjGroup(ClassId(3)),
            ReduceScope::Collection(ClassId(9)),
            ReduceScope::Group(0xAB),
            ReduceScope::Component(2),
            ReduceScope::UserId(77),
        ];
        for scope in scopes {
            assert_eq!(from_bytes::<ReduceScope>(&to_bytes(&scope)).unwrap(), scope);
        }

        let stamps = [
            ReduceStamp::Tag(5),
            ReduceStamp::TagPair(1, 2),
            ReduceStamp::Seq(10),
            ReduceStamp::UserId(4),
            ReduceStamp::Epoch(Epoch(0x55)),
        ];
        for stamp in stamps {
            assert_eq!(from_bytes::<ReduceStamp>(&to_bytes(&stamp)).unwrap(), stamp);
        }
    }
}
