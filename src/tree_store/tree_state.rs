use crate::tree_store::free_list::FreeListMetaData;
use crate::tree_store::generation::{Generation, MAX_GENERATION, MIN_GENERATION};
use crate::tree_store::page_store::{PageCursor, PageId, PagedFile};
use crate::tree_store::tree_node::NodeLayout;
use crate::{Error, Result, StorageBackend, TypeName};
use std::mem::size_of;

// Meta page (id 0):
// 10 bytes: magic number
// 1 byte: format version
// 1 byte: layout marker
// 4 bytes: page size
// 2 bytes + n: key type name
// 2 bytes + n: value type name
//
// State pages (ids 1 and 2):
// 1 byte: version
// 1 byte: clean flag
// 8 bytes: stable generation
// 8 bytes: unstable generation
// 8 bytes: root id
// 8 bytes: root generation
// 8 bytes: last id handed out
// 8 bytes: free-list write page
// 8 bytes: free-list read page
// 4 bytes: free-list write position
// 4 bytes: free-list read position
// 4 bytes: crc32 of all of the above

pub(crate) const META_PAGE_ID: PageId = 0;
pub(crate) const STATE_PAGE_A: PageId = 1;
pub(crate) const STATE_PAGE_B: PageId = 2;

const MAGICNUMBER: [u8; 10] = *b"gbptree\x1a\x0a\xa9";
const FORMAT_VERSION: u8 = 1;
const FORMAT_VERSION_OFFSET: usize = MAGICNUMBER.len();
const LAYOUT_OFFSET: usize = FORMAT_VERSION_OFFSET + size_of::<u8>();
const PAGE_SIZE_OFFSET: usize = LAYOUT_OFFSET + size_of::<u8>();
const TYPE_NAMES_OFFSET: usize = PAGE_SIZE_OFFSET + size_of::<u32>();

const STATE_VERSION: u8 = 1;
const CLEAN_OFFSET: usize = size_of::<u8>();
const STABLE_OFFSET: usize = CLEAN_OFFSET + size_of::<u8>();
const UNSTABLE_OFFSET: usize = STABLE_OFFSET + size_of::<u64>();
const ROOT_ID_OFFSET: usize = UNSTABLE_OFFSET + size_of::<u64>();
const ROOT_GENERATION_OFFSET: usize = ROOT_ID_OFFSET + size_of::<u64>();
const LAST_ID_OFFSET: usize = ROOT_GENERATION_OFFSET + size_of::<u64>();
const WRITE_PAGE_OFFSET: usize = LAST_ID_OFFSET + size_of::<u64>();
const READ_PAGE_OFFSET: usize = WRITE_PAGE_OFFSET + size_of::<u64>();
const WRITE_POS_OFFSET: usize = READ_PAGE_OFFSET + size_of::<u64>();
const READ_POS_OFFSET: usize = WRITE_POS_OFFSET + size_of::<u32>();
const CHECKSUM_OFFSET: usize = READ_POS_OFFSET + size_of::<u32>();
const STATE_LENGTH: usize = CHECKSUM_OFFSET + size_of::<u32>();

/// What a tree was created with
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TreeMeta {
    pub(crate) layout: NodeLayout,
    pub(crate) page_size: usize,
    pub(crate) key_type: TypeName,
    pub(crate) value_type: TypeName,
}

impl TreeMeta {
    /// Reads the page size straight from the backend, before a page cache can be set up
    pub(crate) fn read_page_size(backend: &dyn StorageBackend) -> Result<usize> {
        if backend.len()? < TYPE_NAMES_OFFSET as u64 {
            return Err(Error::Corrupted("file too short for a meta page".to_string()));
        }
        let mut header = [0u8; TYPE_NAMES_OFFSET];
        backend.read(0, &mut header)?;
        if header[..MAGICNUMBER.len()] != MAGICNUMBER {
            return Err(Error::Corrupted("not a gbptree file".to_string()));
        }
        let mut page_size = [0u8; size_of::<u32>()];
        page_size.copy_from_slice(&header[PAGE_SIZE_OFFSET..TYPE_NAMES_OFFSET]);
        Ok(u32::from_be_bytes(page_size) as usize)
    }

    pub(crate) fn read(file: &PagedFile) -> Result<Self> {
        let mut cursor = file.write_cursor();
        cursor.next(META_PAGE_ID)?;
        let mut magic = [0u8; MAGICNUMBER.len()];
        cursor.get_bytes_at(0, &mut magic);
        if magic != MAGICNUMBER {
            return Err(Error::Corrupted("not a gbptree file".to_string()));
        }
        let version = cursor.get_u8_at(FORMAT_VERSION_OFFSET);
        if version != FORMAT_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported format version {version}"
            )));
        }
        let marker = cursor.get_u8_at(LAYOUT_OFFSET);
        let layout = NodeLayout::from_marker(marker)
            .ok_or_else(|| Error::Corrupted(format!("unknown layout marker {marker}")))?;
        let page_size = cursor.get_u32_at(PAGE_SIZE_OFFSET) as usize;
        cursor.set_offset(TYPE_NAMES_OFFSET);
        let key_type = Self::read_type_name(&mut cursor);
        let value_type = Self::read_type_name(&mut cursor);
        if cursor.check_and_clear_bounds_flag() {
            return Err(Error::Corrupted("type names overrun the meta page".to_string()));
        }

        Ok(Self {
            layout,
            page_size,
            key_type,
            value_type,
        })
    }

    fn read_type_name(cursor: &mut PageCursor) -> TypeName {
        let len = cursor.get_u16() as usize;
        let mut name = vec![0u8; len];
        cursor.get_bytes(&mut name);
        TypeName::new(&String::from_utf8_lossy(&name))
    }

    pub(crate) fn write(&self, file: &PagedFile) -> Result {
        let names_len = self.key_type.name().len() + self.value_type.name().len();
        if TYPE_NAMES_OFFSET + 2 * size_of::<u16>() + names_len > self.page_size {
            return Err(Error::MetadataMismatch(
                "type names don't fit in the meta page".to_string(),
            ));
        }
        let mut cursor = file.write_cursor();
        cursor.next(META_PAGE_ID)?;
        cursor.put_zeros_at(0, cursor.page_size());
        cursor.put_bytes_at(0, &MAGICNUMBER);
        cursor.put_u8_at(FORMAT_VERSION_OFFSET, FORMAT_VERSION);
        cursor.put_u8_at(LAYOUT_OFFSET, self.layout.marker());
        cursor.put_u32_at(PAGE_SIZE_OFFSET, self.page_size as u32);
        cursor.set_offset(TYPE_NAMES_OFFSET);
        for name in [&self.key_type, &self.value_type] {
            cursor.put_u16(name.name().len() as u16);
            cursor.put_bytes(name.name().as_bytes());
        }
        Ok(())
    }
}

/// Everything needed to resume a tree as of a checkpoint
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TreeState {
    pub(crate) clean: bool,
    pub(crate) stable: u64,
    pub(crate) unstable: u64,
    pub(crate) root_id: PageId,
    pub(crate) root_generation: u64,
    pub(crate) free_list: FreeListMetaData,
}

impl TreeState {
    pub(crate) fn generation(&self) -> Generation {
        Generation::new(self.stable, self.unstable)
    }

    /// Orders states by recency
    fn is_newer_than(&self, other: &TreeState) -> bool {
        (self.stable, self.unstable) > (other.stable, other.unstable)
    }

    fn encode(&self) -> [u8; STATE_LENGTH] {
        let mut buffer = [0u8; STATE_LENGTH];
        buffer[0] = STATE_VERSION;
        buffer[CLEAN_OFFSET] = u8::from(self.clean);
        let fields: [(usize, u64); 7] = [
            (STABLE_OFFSET, self.stable),
            (UNSTABLE_OFFSET, self.unstable),
            (ROOT_ID_OFFSET, self.root_id),
            (ROOT_GENERATION_OFFSET, self.root_generation),
            (LAST_ID_OFFSET, self.free_list.last_id),
            (WRITE_PAGE_OFFSET, self.free_list.write_page_id),
            (READ_PAGE_OFFSET, self.free_list.read_page_id),
        ];
        for (offset, value) in fields {
            buffer[offset..(offset + size_of::<u64>())].copy_from_slice(&value.to_be_bytes());
        }
        buffer[WRITE_POS_OFFSET..READ_POS_OFFSET]
            .copy_from_slice(&(self.free_list.write_pos as u32).to_be_bytes());
        buffer[READ_POS_OFFSET..CHECKSUM_OFFSET]
            .copy_from_slice(&(self.free_list.read_pos as u32).to_be_bytes());
        let checksum = crc32fast::hash(&buffer[..CHECKSUM_OFFSET]);
        buffer[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_be_bytes());
        buffer
    }

    /// None if the bytes don't hold a valid state
    fn decode(buffer: &[u8; STATE_LENGTH]) -> Option<Self> {
        if buffer[0] != STATE_VERSION {
            return None;
        }
        let stored = u32::from_be_bytes(buffer[CHECKSUM_OFFSET..].try_into().ok()?);
        if stored != crc32fast::hash(&buffer[..CHECKSUM_OFFSET]) {
            return None;
        }
        let u64_at = |offset: usize| -> Option<u64> {
            Some(u64::from_be_bytes(
                buffer[offset..(offset + size_of::<u64>())].try_into().ok()?,
            ))
        };
        let u32_at = |offset: usize| -> Option<usize> {
            Some(u32::from_be_bytes(buffer[offset..(offset + size_of::<u32>())].try_into().ok()?)
                as usize)
        };
        let state = Self {
            clean: buffer[CLEAN_OFFSET] != 0,
            stable: u64_at(STABLE_OFFSET)?,
            unstable: u64_at(UNSTABLE_OFFSET)?,
            root_id: u64_at(ROOT_ID_OFFSET)?,
            root_generation: u64_at(ROOT_GENERATION_OFFSET)?,
            free_list: FreeListMetaData {
                last_id: u64_at(LAST_ID_OFFSET)?,
                write_page_id: u64_at(WRITE_PAGE_OFFSET)?,
                read_page_id: u64_at(READ_PAGE_OFFSET)?,
                write_pos: u32_at(WRITE_POS_OFFSET)?,
                read_pos: u32_at(READ_POS_OFFSET)?,
            },
        };
        // Leaves room for the generation bump of an unclean open
        if state.stable < MIN_GENERATION
            || state.stable >= state.unstable
            || state.unstable >= MAX_GENERATION
        {
            return None;
        }
        Some(state)
    }

    fn read_slot(file: &PagedFile, page_id: PageId) -> Result<Option<Self>> {
        let mut cursor = file.write_cursor();
        cursor.next(page_id)?;
        let mut buffer = [0u8; STATE_LENGTH];
        cursor.get_bytes_at(0, &mut buffer);
        Ok(Self::decode(&buffer))
    }

    pub(crate) fn write(&self, file: &PagedFile, page_id: PageId) -> Result {
        let mut cursor = file.write_cursor();
        cursor.next(page_id)?;
        cursor.put_zeros_at(0, cursor.page_size());
        cursor.put_bytes_at(0, &self.encode());
        Ok(())
    }

    /// The newest valid state and the slot it was read from
    pub(crate) fn read_newest(file: &PagedFile) -> Result<(Self, PageId)> {
        let a = Self::read_slot(file, STATE_PAGE_A)?;
        let b = Self::read_slot(file, STATE_PAGE_B)?;
        match (a, b) {
            (Some(a), Some(b)) => {
                if b.is_newer_than(&a) {
                    Ok((b, STATE_PAGE_B))
                } else {
                    Ok((a, STATE_PAGE_A))
                }
            }
            (Some(a), None) => Ok((a, STATE_PAGE_A)),
            (None, Some(b)) => Ok((b, STATE_PAGE_B)),
            (None, None) => Err(Error::Corrupted(
                "neither tree state page is valid".to_string(),
            )),
        }
    }
}

/// The state slot a checkpoint writes to, given the slot holding the newest state
pub(crate) fn other_slot(slot: PageId) -> PageId {
    if slot == STATE_PAGE_A {
        STATE_PAGE_B
    } else {
        STATE_PAGE_A
    }
}
