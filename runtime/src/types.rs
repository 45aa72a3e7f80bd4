use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

/// Dense process identifier in `[0, num_nodes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel destination; never a valid node.
    pub const UNINITIALIZED: NodeId = NodeId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::UNINITIALIZED
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a registered active handler. Resolution happens through
/// [`crate::messaging::HandlerKinds`]; registration order is part of the
/// program contract, so equal IDs name the same logical function on every
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

/// Identifier for a registered combine operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

/// Identifier for an entity class: one indexed collection or one object
/// group. Allocation is collective and deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// A routable entity: an element of a collection (linearized index) or the
/// per-node singleton of an object group (index 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub class: ClassId,
    pub index: u64,
}

impl EntityId {
    pub fn new(class: ClassId, index: u64) -> Self {
        Self { class, index }
    }
}

/// Monotone collective phase counter.
pub type Phase = u64;

/// Optional subdivision of a phase for statistics and focused LB.
pub type SubPhase = u16;

/// Sentinel: statistics recorded outside any subphase.
pub const NO_SUBPHASE: SubPhase = SubPhase::MAX;

/// General-purpose tag (barriers, collective scopes).
pub type Tag = u64;

pub const NO_TAG: Tag = Tag::MAX;

impl Wire for NodeId {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(NodeId(u32::de(reader)?))
    }
}

impl Wire for HandlerId {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(HandlerId(u32::de(reader)?))
    }
}

impl Wire for OpId {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(OpId(u32::de(reader)?))
    }
}

impl Wire for ClassId {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(ClassId(u32::de(reader)?))
    }
}

impl Wire for EntityId {
    fn ser(&self, writer: &mut ByteWriter) {
        self.class.ser(writer);
        self.index.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(EntityId {
            class: ClassId::de(reader)?,
            index: u64::de(reader)?,
        })
    }
}
