// Entry headers of the dynamic node layout.
//
// Key header, one or two bytes:
//   byte 0: [tombstone 1][offload 1][has second byte 1][key size, low 5 bits]
//   byte 1: key size, bits 5..13
// Value header (leaf entries only), one or two bytes:
//   byte 0: [has second byte 1][value size, low 7 bits]
//   byte 1: value size, bits 7..15
// Offloaded entries always use both bytes of each header, followed by the 6 byte id of the
// first offload record.
use crate::tree_store::page_store::PageCursor;

const FLAG_TOMBSTONE: u8 = 0x80;
const FLAG_OFFLOAD: u8 = 0x40;
const FLAG_ADDITIONAL_KEY_SIZE: u8 = 0x20;
const MASK_ONE_BYTE_KEY_SIZE: u8 = 0x1F;
const SHIFT_LSB_KEY_SIZE: usize = 5;
const FLAG_ADDITIONAL_VALUE_SIZE: u8 = 0x80;
const MASK_ONE_BYTE_VALUE_SIZE: u8 = 0x7F;
const SHIFT_LSB_VALUE_SIZE: usize = 7;

pub(crate) const MAX_ONE_BYTE_KEY_SIZE: usize = MASK_ONE_BYTE_KEY_SIZE as usize;
pub(crate) const MAX_ONE_BYTE_VALUE_SIZE: usize = MASK_ONE_BYTE_VALUE_SIZE as usize;
pub(crate) const MAX_TWO_BYTE_KEY_SIZE: usize = (1 << (SHIFT_LSB_KEY_SIZE + 8)) - 1;
pub(crate) const MAX_TWO_BYTE_VALUE_SIZE: usize = (1 << (SHIFT_LSB_VALUE_SIZE + 8)) - 1;
pub(crate) const OFFLOAD_ID_SIZE: usize = 6;
pub(crate) const MAX_KEY_VALUE_HEADER_SIZE: usize = 4;

// Packed descriptor layout
const KEY_SIZE_MASK: u64 = 0xFFFF;
const VALUE_SIZE_SHIFT: u32 = 16;
const TOMBSTONE_BIT: u64 = 1 << 32;
const OFFLOAD_BIT: u64 = 1 << 33;

/// Sizes and flags decoded from an entry header
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct KeyValueSize(u64);

impl KeyValueSize {
    fn new(key_size: usize, value_size: usize, tombstone: bool, offload: bool) -> Self {
        let mut packed = (key_size as u64 & KEY_SIZE_MASK)
            | ((value_size as u64 & KEY_SIZE_MASK) << VALUE_SIZE_SHIFT);
        if tombstone {
            packed |= TOMBSTONE_BIT;
        }
        if offload {
            packed |= OFFLOAD_BIT;
        }
        Self(packed)
    }

    pub(crate) fn extract_key_size(&self) -> usize {
        (self.0 & KEY_SIZE_MASK) as usize
    }

    pub(crate) fn extract_value_size(&self) -> usize {
        ((self.0 >> VALUE_SIZE_SHIFT) & KEY_SIZE_MASK) as usize
    }

    pub(crate) fn extract_tombstone(&self) -> bool {
        self.0 & TOMBSTONE_BIT != 0
    }

    pub(crate) fn extract_offload(&self) -> bool {
        self.0 & OFFLOAD_BIT != 0
    }
}

pub(crate) fn key_header_size(key_size: usize, offload: bool) -> usize {
    if offload || key_size > MAX_ONE_BYTE_KEY_SIZE {
        2
    } else {
        1
    }
}

pub(crate) fn value_header_size(value_size: usize, offload: bool) -> usize {
    if offload || value_size > MAX_ONE_BYTE_VALUE_SIZE {
        2
    } else {
        1
    }
}

/// Header bytes of a leaf entry, including the offload id if any
pub(crate) fn key_value_header_size(key_size: usize, value_size: usize, offload: bool) -> usize {
    key_header_size(key_size, offload)
        + value_header_size(value_size, offload)
        + if offload { OFFLOAD_ID_SIZE } else { 0 }
}

/// Header bytes of an internal entry, including the offload id if any
pub(crate) fn key_child_header_size(key_size: usize, offload: bool) -> usize {
    key_header_size(key_size, offload) + if offload { OFFLOAD_ID_SIZE } else { 0 }
}

fn put_key_size(cursor: &mut PageCursor, key_size: usize, offload: bool) {
    debug_assert!(key_size <= MAX_TWO_BYTE_KEY_SIZE);
    let flags = if offload { FLAG_OFFLOAD } else { 0 };
    if key_header_size(key_size, offload) == 1 {
        cursor.put_u8(flags | key_size as u8);
    } else {
        cursor.put_u8(
            flags | FLAG_ADDITIONAL_KEY_SIZE | (key_size as u8 & MASK_ONE_BYTE_KEY_SIZE),
        );
        cursor.put_u8((key_size >> SHIFT_LSB_KEY_SIZE) as u8);
    }
}

fn put_value_size(cursor: &mut PageCursor, value_size: usize, offload: bool) {
    debug_assert!(value_size <= MAX_TWO_BYTE_VALUE_SIZE);
    if value_header_size(value_size, offload) == 1 {
        cursor.put_u8(value_size as u8);
    } else {
        cursor.put_u8(FLAG_ADDITIONAL_VALUE_SIZE | (value_size as u8 & MASK_ONE_BYTE_VALUE_SIZE));
        cursor.put_u8((value_size >> SHIFT_LSB_VALUE_SIZE) as u8);
    }
}

/// Writes a leaf entry header at the cursor's offset and advances past it
pub(crate) fn put_key_value_header(
    cursor: &mut PageCursor,
    key_size: usize,
    value_size: usize,
    offload_id: Option<u64>,
) {
    put_key_size(cursor, key_size, offload_id.is_some());
    put_value_size(cursor, value_size, offload_id.is_some());
    if let Some(id) = offload_id {
        cursor.put_u48(id);
    }
}

/// Writes an internal entry header at the cursor's offset and advances past it
pub(crate) fn put_key_child_header(cursor: &mut PageCursor, key_size: usize, offload_id: Option<u64>) {
    put_key_size(cursor, key_size, offload_id.is_some());
    if let Some(id) = offload_id {
        cursor.put_u48(id);
    }
}

fn read_key_header(cursor: &mut PageCursor) -> (usize, bool, bool) {
    let first = cursor.get_u8();
    let tombstone = first & FLAG_TOMBSTONE != 0;
    let offload = first & FLAG_OFFLOAD != 0;
    let mut key_size = (first & MASK_ONE_BYTE_KEY_SIZE) as usize;
    if first & FLAG_ADDITIONAL_KEY_SIZE != 0 {
        key_size |= (cursor.get_u8() as usize) << SHIFT_LSB_KEY_SIZE;
    }
    (key_size, tombstone, offload)
}

/// Reads an internal entry header. Leaves the cursor at the offload id, if any, otherwise at the
/// key bytes
pub(crate) fn read_key_size(cursor: &mut PageCursor) -> KeyValueSize {
    let (key_size, tombstone, offload) = read_key_header(cursor);
    KeyValueSize::new(key_size, 0, tombstone, offload)
}

/// Reads a leaf entry header. Leaves the cursor at the offload id, if any, otherwise at the key
/// bytes
pub(crate) fn read_key_value_size(cursor: &mut PageCursor) -> KeyValueSize {
    let (key_size, tombstone, offload) = read_key_header(cursor);
    let first = cursor.get_u8();
    let mut value_size = (first & MASK_ONE_BYTE_VALUE_SIZE) as usize;
    if first & FLAG_ADDITIONAL_VALUE_SIZE != 0 {
        value_size |= (cursor.get_u8() as usize) << SHIFT_LSB_VALUE_SIZE;
    }
    KeyValueSize::new(key_size, value_size, tombstone, offload)
}

pub(crate) fn read_offload_id(cursor: &mut PageCursor) -> u64 {
    cursor.get_u48()
}

/// Marks the entry starting at `offset` as dead
pub(crate) fn put_tombstone(cursor: &mut PageCursor, offset: usize) {
    let first = cursor.get_u8_at(offset);
    cursor.put_u8_at(offset, first | FLAG_TOMBSTONE);
}
