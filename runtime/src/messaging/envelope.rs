use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::collective::reduce::scope::{ReduceScope, ReduceStamp};
use crate::epoch::Epoch;
use crate::types::{ClassId, EntityId, HandlerId, NodeId, OpId};

/// Where a message is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    /// A specific process
    Node(NodeId),
    /// An element of a collection (or an object-group instance at
    /// index 0), routed through the location layer
    Entity {
        class: ClassId,
        index: u64,
        home: NodeId,
    },
    /// Every process, relayed down the spanning tree rooted at `root`
    Broadcast { root: NodeId },
}

/// Reduction block carried by contribution messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceBlock {
    pub root: NodeId,
    pub scope: ReduceScope,
    pub stamp: ReduceStamp,
    pub op: OpId,
}

/// Message header. Travels in front of the payload in every buffer the
/// transport carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: NodeId,
    pub dest: Dest,
    pub handler: HandlerId,
    pub epoch: Epoch,
    pub reduce: Option<ReduceBlock>,
    /// Location-forwarding hop count for entity-addressed messages
    pub hops: u8,
    /// The element executing when this message was sent; the from-side of
    /// the communication edge in statistics
    pub from_elm: Option<EntityId>,
    pub payload_len: u32,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        matches!(self.dest, Dest::Broadcast { .. })
    }

    /// Whether this message participates in termination accounting.
    pub fn is_term_counted(&self) -> bool {
        !self.epoch.is_no_epoch()
    }
}

impl Wire for Dest {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            Dest::Node(node) => {
                writer.write_byte(0);
                node.ser(writer);
            }
            Dest::Entity { class, index, home } => {
                writer.write_byte(1);
                class.ser(writer);
                index.ser(writer);
                home.ser(writer);
            }
            Dest::Broadcast { root } => {
                writer.write_byte(2);
                root.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(Dest::Node(NodeId::de(reader)?)),
            1 => Ok(Dest::Entity {
                class: ClassId::de(reader)?,
                index: u64::de(reader)?,
                home: NodeId::de(reader)?,
            }),
            2 => Ok(Dest::Broadcast {
                root: NodeId::de(reader)?,
            }),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "Dest",
            }),
        }
    }
}

impl Wire for ReduceBlock {
    fn ser(&self, writer: &mut ByteWriter) {
        self.root.ser(writer);
        self.scope.ser(writer);
        self.stamp.ser(writer);
        self.op.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(ReduceBlock {
            root: NodeId::de(reader)?,
            scope: ReduceScope::de(reader)?,
            stamp: ReduceStamp::de(reader)?,
            op: OpId::de(reader)?,
        })
    }
}

impl Wire for Envelope {
    fn ser(&self, writer: &mut ByteWriter) {
        self.source.ser(writer);
        self.dest.ser(writer);
        self.handler.ser(writer);
        self.epoch.ser(writer);
        self.reduce.ser(writer);
        self.hops.ser(writer);
        self.from_elm.ser(writer);
        self.payload_len.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Envelope {
            source: NodeId::de(reader)?,
            dest: Dest::de(reader)?,
            handler: HandlerId::de(reader)?,
            epoch: Epoch::de(reader)?,
            reduce: Option::<ReduceBlock>::de(reader)?,
            hops: u8::de(reader)?,
            from_elm: Option::<EntityId>::de(reader)?,
            payload_len: u32::de(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plenum_wire::{from_bytes, to_bytes};

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope {
            source: NodeId(3),
            dest: Dest::Entity {
                class: ClassId(1),
                index: 42,
                home: NodeId(0),
            },
            handler: HandlerId(17),
            epoch: Epoch(0x0123_4567),
            reduce: Some(ReduceBlock {
                root: NodeId(0),
                scope: ReduceScope::Collection(ClassId(1)),
                stamp: ReduceStamp::Seq(9),
                op: OpId(2),
            }),
            hops: 2,
            from_elm: Some(EntityId::new(ClassId(1), 7)),
            payload_len: 128,
        };
        let back: Envelope = from_bytes(&to_bytes(&envelope)).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn no_epoch_messages_skip_termination_accounting() {
        let envelope = Envelope {
            source: NodeId(0),
            dest: Dest::Node(NodeId(1)),
            handler: HandlerId(0),
            epoch: Epoch::NO_EPOCH,
            reduce: None,
            hops: 0,
            from_elm: None,
            payload_len: 0,
        };
        assert!(!envelope.is_term_counted());
        assert!(!envelope.is_broadcast());
    }
}
