use crate::tree_store::generation::MIN_GENERATION;
use crate::tree_store::page_store::PageCursor;
use std::fmt::{Display, Formatter};

// Slot layout: generation (4) | pointer (6) | checksum (2)
const GENERATION_SIZE: usize = 4;
const POINTER_SIZE: usize = 6;
const CHECKSUM_SIZE: usize = 2;
const POINTER_OFFSET: usize = GENERATION_SIZE;
const CHECKSUM_OFFSET: usize = GENERATION_SIZE + POINTER_SIZE;

pub(crate) const GSP_SIZE: usize = GENERATION_SIZE + POINTER_SIZE + CHECKSUM_SIZE;
pub(crate) const GSPP_SIZE: usize = GSP_SIZE * 2;

pub(crate) const NO_NODE: u64 = 0;
pub(crate) const MAX_POINTER: u64 = (1 << (POINTER_SIZE * 8)) - 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    A,
    B,
}

impl Slot {
    fn offset(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => GSP_SIZE,
        }
    }
}

/// How one slot of a pointer pair relates to the generation it is read or written under
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SlotState {
    Empty,
    /// Checksum mismatch, or a generation no writer could have produced
    Broken,
    /// Written in a checkpointed generation
    Stable,
    /// Written in the current generation
    Unstable,
    /// Written after the last checkpoint by a process that never reached the next one
    Crash,
}

impl SlotState {
    fn is_invalid(self) -> bool {
        matches!(self, SlotState::Empty | SlotState::Broken | SlotState::Crash)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct GenerationSafePointer {
    generation: u64,
    pointer: u64,
    checksum: u16,
}

impl GenerationSafePointer {
    fn read(cursor: &mut PageCursor, offset: usize) -> Self {
        Self {
            generation: cursor.get_u32_at(offset) as u64,
            pointer: cursor.get_u48_at(offset + POINTER_OFFSET),
            checksum: cursor.get_u16_at(offset + CHECKSUM_OFFSET),
        }
    }

    fn write(cursor: &mut PageCursor, offset: usize, generation: u64, pointer: u64) {
        assert!(generation >= MIN_GENERATION && generation <= u32::MAX as u64);
        assert!(pointer <= MAX_POINTER, "pointer {pointer} out of range");
        cursor.put_u32_at(offset, generation as u32);
        cursor.put_u48_at(offset + POINTER_OFFSET, pointer);
        cursor.put_u16_at(offset + CHECKSUM_OFFSET, checksum_of(generation, pointer));
    }

    fn state(&self, stable: u64, unstable: u64) -> SlotState {
        if self.generation == 0 && self.pointer == 0 && self.checksum == 0 {
            SlotState::Empty
        } else if self.checksum != checksum_of(self.generation, self.pointer)
            || self.generation < MIN_GENERATION
        {
            SlotState::Broken
        } else if self.generation <= stable {
            SlotState::Stable
        } else if self.generation == unstable {
            SlotState::Unstable
        } else {
            SlotState::Crash
        }
    }
}

/// XOR of the 16 bit chunks of the generation and the pointer
pub(crate) fn checksum_of(generation: u64, pointer: u64) -> u16 {
    let generation = (generation as u32).to_be_bytes();
    let pointer = pointer.to_be_bytes();
    generation
        .chunks(2)
        .chain(pointer[2..].chunks(2))
        .fold(0u16, |acc, chunk| acc ^ u16::from_be_bytes([chunk[0], chunk[1]]))
}

/// A successfully resolved pointer pair
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PointerRead {
    pub(crate) pointer: u64,
    /// Generation the pointer was written at
    pub(crate) generation: u64,
    pub(crate) slot: Slot,
}

/// A pointer pair whose slots don't resolve to a single pointer under the given generation
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PointerFailure {
    pub(crate) writing: bool,
    pub(crate) state_a: SlotState,
    pub(crate) state_b: SlotState,
    pub(crate) generation_a: u64,
    pub(crate) generation_b: u64,
    pub(crate) stable: u64,
    pub(crate) unstable: u64,
}

impl Display for PointerFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pointer failed: slot A {:?} (generation {}), slot B {:?} (generation {}), stable {} unstable {}",
            if self.writing { "writing" } else { "reading" },
            self.state_a,
            self.generation_a,
            self.state_b,
            self.generation_b,
            self.stable,
            self.unstable
        )
    }
}

fn read_both(cursor: &mut PageCursor, offset: usize) -> (GenerationSafePointer, GenerationSafePointer) {
    (
        GenerationSafePointer::read(cursor, offset + Slot::A.offset()),
        GenerationSafePointer::read(cursor, offset + Slot::B.offset()),
    )
}

/// Resolves the pointer pair at `offset`.
///
/// A stable slot competes with an older stable slot by generation; an unstable slot wins over a
/// stable one; crashed, broken and empty slots are ignored.
pub(crate) fn read(
    cursor: &mut PageCursor,
    offset: usize,
    stable: u64,
    unstable: u64,
) -> Result<PointerRead, PointerFailure> {
    let (a, b) = read_both(cursor, offset);
    let state_a = a.state(stable, unstable);
    let state_b = b.state(stable, unstable);

    let chosen = match (state_a, state_b) {
        (SlotState::Stable, SlotState::Stable) => {
            if a.generation > b.generation {
                Some(Slot::A)
            } else if b.generation > a.generation {
                Some(Slot::B)
            } else {
                None
            }
        }
        (SlotState::Stable, SlotState::Unstable) => Some(Slot::B),
        (SlotState::Unstable, SlotState::Stable) => Some(Slot::A),
        (SlotState::Stable, state) | (SlotState::Unstable, state) if state.is_invalid() => {
            Some(Slot::A)
        }
        (state, SlotState::Stable) | (state, SlotState::Unstable) if state.is_invalid() => {
            Some(Slot::B)
        }
        _ => None,
    };

    match chosen {
        Some(Slot::A) => Ok(PointerRead {
            pointer: a.pointer,
            generation: a.generation,
            slot: Slot::A,
        }),
        Some(Slot::B) => Ok(PointerRead {
            pointer: b.pointer,
            generation: b.generation,
            slot: Slot::B,
        }),
        None => Err(PointerFailure {
            writing: false,
            state_a,
            state_b,
            generation_a: a.generation,
            generation_b: b.generation,
            stable,
            unstable,
        }),
    }
}

/// Writes `pointer` at generation `unstable` into the pointer pair at `offset`.
///
/// The newest stable slot is never overwritten, so the pointer as of the last checkpoint stays
/// readable until the next checkpoint.
pub(crate) fn write(
    cursor: &mut PageCursor,
    offset: usize,
    pointer: u64,
    stable: u64,
    unstable: u64,
) -> Result<Slot, PointerFailure> {
    let (a, b) = read_both(cursor, offset);
    let state_a = a.state(stable, unstable);
    let state_b = b.state(stable, unstable);

    let slot = match (state_a, state_b) {
        (SlotState::Unstable, SlotState::Unstable) => None,
        (SlotState::Unstable, _) => Some(Slot::A),
        (_, SlotState::Unstable) => Some(Slot::B),
        (SlotState::Stable, SlotState::Stable) => {
            if a.generation < b.generation {
                Some(Slot::A)
            } else if b.generation < a.generation {
                Some(Slot::B)
            } else {
                None
            }
        }
        (SlotState::Stable, _) => Some(Slot::B),
        (_, SlotState::Stable) => Some(Slot::A),
        _ => Some(Slot::A),
    };

    match slot {
        Some(slot) => {
            GenerationSafePointer::write(cursor, offset + slot.offset(), unstable, pointer);
            Ok(slot)
        }
        None => Err(PointerFailure {
            writing: true,
            state_a,
            state_b,
            generation_a: a.generation,
            generation_b: b.generation,
            stable,
            unstable,
        }),
    }
}

/// Zeroes both slots of the pointer pair at `offset`
pub(crate) fn clean(cursor: &mut PageCursor, offset: usize) {
    cursor.put_zeros_at(offset, GSPP_SIZE);
}

/// Zeroes every slot of the pointer pair at `offset` written at a crash generation. Returns the
/// number of slots cleaned
pub(crate) fn clean_crash_slots(
    cursor: &mut PageCursor,
    offset: usize,
    stable: u64,
    unstable: u64,
) -> usize {
    let mut cleaned = 0;
    for slot in [Slot::A, Slot::B] {
        let slot_offset = offset + slot.offset();
        let gsp = GenerationSafePointer::read(cursor, slot_offset);
        if gsp.state(stable, unstable) == SlotState::Crash {
            cursor.put_zeros_at(slot_offset, GSP_SIZE);
            cleaned += 1;
        }
    }
    cleaned
}
