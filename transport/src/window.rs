/// Handle to a collectively allocated one-sided window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

/// Lock level for a one-sided access epoch, per MPI-3: shared locks admit
/// concurrent readers on the same target, exclusive locks are mutually
/// exclusive with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLevel {
    None,
    Shared,
    Exclusive,
}

/// Element interpretation for accumulate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumKind {
    F64,
    U64,
    I64,
}

impl AccumKind {
    pub fn width(self) -> usize {
        8
    }
}

/// Assertions for `fence`, matching the MPI-3 assert mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FenceAssert(pub u8);

impl FenceAssert {
    pub const NONE: FenceAssert = FenceAssert(0);
    pub const NOSTORE: FenceAssert = FenceAssert(1 << 0);
    pub const NOPUT: FenceAssert = FenceAssert(1 << 1);
    pub const NOPRECEDE: FenceAssert = FenceAssert(1 << 2);
    pub const NOSUCCEED: FenceAssert = FenceAssert(1 << 3);

    pub fn contains(self, other: FenceAssert) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FenceAssert {
    type Output = FenceAssert;

    fn bitor(self, rhs: FenceAssert) -> FenceAssert {
        FenceAssert(self.0 | rhs.0)
    }
}

/// Token for an outstanding `rget`/`rput`/`raccum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request(pub u64);
