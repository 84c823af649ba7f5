use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::errors::CpuFault;
use crate::vm::decoder::{self, DecodedInstruction, RELOC_SENTINEL};

pub const SEGMENT_SIZE: usize = 1 << 16;

/// Longest x86 instruction; bounds the cache window a write can invalidate.
const MAX_INSTRUCTION_LEN: u16 = 15;

/// A 16:16 far pointer. The segment is a selector treated as opaque for
/// identity: two pointers are equal iff both components are equal, never via
/// `segment * 16 + offset` normalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FarPtr {
    pub segment: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Packed dword layout used on the guest stack and in guest memory:
    /// offset in the low word, segment in the high word.
    pub const fn to_dword(self) -> u32 {
        ((self.segment as u32) << 16) | self.offset as u32
    }

    pub const fn from_dword(value: u32) -> Self {
        Self {
            segment: (value >> 16) as u16,
            offset: value as u16,
        }
    }
}

impl std::fmt::Display for FarPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
    Stack,
}

/// Where a relocation slot points once resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationTarget {
    /// Fix-up into another segment of the same module.
    InternalRef(FarPtr),
    /// Imported API function, identified by library and function ordinal.
    ImportedOrdinal { import: u16, ordinal: u16 },
    /// Imported API function identified by library ordinal and a name-table
    /// offset the loader already resolved to an ordinal-compatible value.
    ImportedName { import: u16, name_ordinal: u16 },
}

impl RelocationTarget {
    /// The far value a guest read of the relocated slot observes: offset (or
    /// function ordinal) in the low word, segment selector (or import
    /// ordinal) in the high word.
    pub fn resolved(&self) -> FarPtr {
        match *self {
            RelocationTarget::InternalRef(ptr) => ptr,
            RelocationTarget::ImportedOrdinal { import, ordinal } => FarPtr::new(import, ordinal),
            RelocationTarget::ImportedName {
                import,
                name_ordinal,
            } => FarPtr::new(import, name_ordinal),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocationRecord {
    /// Offset of the patched word within its segment.
    pub offset: u16,
    pub target: RelocationTarget,
}

/// One guest segment: a full 64 KiB byte array (so offset arithmetic wraps
/// instead of faulting) plus, for code, a lazily built decoded-instruction
/// cache keyed by byte offset.
pub struct Segment {
    pub selector: u16,
    pub kind: SegmentKind,
    data: Box<[u8]>,
    cache: Option<HashMap<u16, DecodedInstruction>>,
}

impl Segment {
    fn new(selector: u16, kind: SegmentKind, image: &[u8]) -> Self {
        let mut data = vec![0u8; SEGMENT_SIZE].into_boxed_slice();
        let len = image.len().min(SEGMENT_SIZE);
        data[..len].copy_from_slice(&image[..len]);
        Self {
            selector,
            kind,
            data,
            cache: None,
        }
    }

    #[inline]
    pub fn read_byte(&self, offset: u16) -> u8 {
        self.data[offset as usize]
    }

    /// Little-endian word read; a read at 0xFFFF wraps to offset 0 of the
    /// same segment (real-mode behavior).
    #[inline]
    pub fn read_word(&self, offset: u16) -> u16 {
        if offset == u16::MAX {
            u16::from_le_bytes([self.data[SEGMENT_SIZE - 1], self.data[0]])
        } else {
            LittleEndian::read_u16(&self.data[offset as usize..])
        }
    }

    #[inline]
    pub fn read_dword(&self, offset: u16) -> u32 {
        let lo = self.read_word(offset) as u32;
        let hi = self.read_word(offset.wrapping_add(2)) as u32;
        (hi << 16) | lo
    }

    fn write_byte(&mut self, offset: u16, value: u8) {
        self.data[offset as usize] = value;
        self.invalidate(offset, 1);
    }

    fn write_word(&mut self, offset: u16, value: u16) {
        let bytes = value.to_le_bytes();
        self.data[offset as usize] = bytes[0];
        self.data[offset.wrapping_add(1) as usize] = bytes[1];
        self.invalidate(offset, 2);
    }

    fn write_dword(&mut self, offset: u16, value: u32) {
        self.write_word(offset, value as u16);
        self.write_word(offset.wrapping_add(2), (value >> 16) as u16);
    }

    fn write_array(&mut self, offset: u16, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.data[offset.wrapping_add(i as u16) as usize] = *byte;
        }
        self.invalidate(offset, bytes.len());
    }

    /// Discard cached instructions whose bytes overlap `[offset, offset+len)`.
    /// The range is tracked in u32 so a write reaching the top of the segment
    /// is not clipped, and a write that wraps past 0xFFFF (word stores do,
    /// matching `read_word`) also invalidates the low-offset bytes it landed
    /// on. Cached instructions themselves never wrap: the decoder stops at
    /// the end of the segment.
    fn invalidate(&mut self, offset: u16, len: usize) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let start = offset as u32;
        let end = start + len.min(SEGMENT_SIZE) as u32;
        Self::invalidate_span(cache, start, end.min(SEGMENT_SIZE as u32));
        if end > SEGMENT_SIZE as u32 {
            Self::invalidate_span(cache, 0, end - SEGMENT_SIZE as u32);
        }
    }

    fn invalidate_span(cache: &mut HashMap<u16, DecodedInstruction>, lo: u32, hi: u32) {
        let start = lo.saturating_sub(MAX_INSTRUCTION_LEN as u32 - 1);
        for candidate in start..hi {
            let overlaps = cache
                .get(&(candidate as u16))
                .is_some_and(|entry| candidate + entry.len() as u32 > lo);
            if overlaps {
                cache.remove(&(candidate as u16));
            }
        }
    }

    fn instruction_at(&mut self, offset: u16) -> Option<DecodedInstruction> {
        let cache = self
            .cache
            .get_or_insert_with(|| decoder::decode_segment(&self.data));
        if let Some(decoded) = cache.get(&offset) {
            return Some(*decoded);
        }
        // Jump target inside bytes the linear pass consumed as operands.
        let decoded = decoder::decode_at(&self.data, offset)?;
        cache.insert(offset, decoded);
        Some(decoded)
    }
}

struct VariableArena {
    selector: u16,
    cursor: u32,
    limit: u32,
}

/// The module's segmented address space: segment table, pre-indexed
/// relocation records, and the named-variable allocator the host uses to
/// carve guest-visible storage.
pub struct MemoryCore {
    segments: HashMap<u16, Segment>,
    relocations: HashMap<(u16, u16), RelocationRecord>,
    variables: HashMap<String, FarPtr>,
    arenas: Vec<VariableArena>,
    default_data_segment: Option<u16>,
}

impl MemoryCore {
    pub fn new() -> Self {
        Self {
            segments: HashMap::new(),
            relocations: HashMap::new(),
            variables: HashMap::new(),
            arenas: Vec::new(),
            default_data_segment: None,
        }
    }

    /// Register a loader-provided segment. Relocation records are indexed by
    /// `(selector, offset)` up front so operand decode can query them flat.
    pub fn add_segment(
        &mut self,
        selector: u16,
        kind: SegmentKind,
        image: &[u8],
        relocations: Vec<RelocationRecord>,
    ) {
        let segment = Segment::new(selector, kind, image);
        for record in relocations {
            if segment.read_word(record.offset) != RELOC_SENTINEL {
                warn!(
                    "relocation at {:04X}:{:04X} does not cover a sentinel word",
                    selector, record.offset
                );
            }
            self.relocations.insert((selector, record.offset), record);
        }
        debug!("segment {:04X} registered ({:?}, {} bytes)", selector, kind, image.len());
        self.segments.insert(selector, segment);
    }

    /// Register a zero-filled data segment whose first `size` bytes are
    /// available to `allocate_variable`.
    pub fn add_variable_segment(&mut self, selector: u16, size: u16) {
        self.segments
            .insert(selector, Segment::new(selector, SegmentKind::Data, &[]));
        self.arenas.push(VariableArena {
            selector,
            cursor: 0,
            limit: size as u32,
        });
    }

    /// Bump-allocate `size` bytes of guest-visible storage, optionally
    /// remembering it under `name` for later lookup.
    pub fn allocate_variable(
        &mut self,
        name: Option<&str>,
        size: u16,
    ) -> Result<FarPtr, CpuFault> {
        let arena = self
            .arenas
            .iter_mut()
            .find(|arena| arena.cursor + size as u32 <= arena.limit)
            .ok_or(CpuFault::OutOfVariableSpace)?;
        let ptr = FarPtr::new(arena.selector, arena.cursor as u16);
        // Keep allocations word-aligned; guest code assumes even addresses.
        arena.cursor += (size as u32 + 1) & !1;
        if let Some(name) = name {
            self.variables.insert(name.to_owned(), ptr);
        }
        Ok(ptr)
    }

    pub fn variable(&self, name: &str) -> Option<FarPtr> {
        self.variables.get(name).copied()
    }

    pub fn set_default_data_segment(&mut self, selector: u16) {
        self.default_data_segment = Some(selector);
    }

    pub fn default_data_segment(&self) -> Option<u16> {
        self.default_data_segment
    }

    pub fn segment(&self, selector: u16) -> Result<&Segment, CpuFault> {
        self.segments
            .get(&selector)
            .ok_or(CpuFault::SegmentMissing(selector))
    }

    fn segment_mut(&mut self, selector: u16) -> Result<&mut Segment, CpuFault> {
        self.segments
            .get_mut(&selector)
            .ok_or(CpuFault::SegmentMissing(selector))
    }

    pub fn relocation(&self, selector: u16, offset: u16) -> Option<&RelocationRecord> {
        self.relocations.get(&(selector, offset))
    }

    pub fn get_byte(&self, selector: u16, offset: u16) -> Result<u8, CpuFault> {
        Ok(self.segment(selector)?.read_byte(offset))
    }

    pub fn get_word(&self, selector: u16, offset: u16) -> Result<u16, CpuFault> {
        Ok(self.segment(selector)?.read_word(offset))
    }

    pub fn get_dword(&self, selector: u16, offset: u16) -> Result<u32, CpuFault> {
        Ok(self.segment(selector)?.read_dword(offset))
    }

    pub fn get_array(&self, selector: u16, offset: u16, len: u16) -> Result<Vec<u8>, CpuFault> {
        let segment = self.segment(selector)?;
        Ok((0..len)
            .map(|i| segment.read_byte(offset.wrapping_add(i)))
            .collect())
    }

    pub fn set_byte(&mut self, selector: u16, offset: u16, value: u8) -> Result<(), CpuFault> {
        self.segment_mut(selector)?.write_byte(offset, value);
        Ok(())
    }

    pub fn set_word(&mut self, selector: u16, offset: u16, value: u16) -> Result<(), CpuFault> {
        self.segment_mut(selector)?.write_word(offset, value);
        Ok(())
    }

    pub fn set_dword(&mut self, selector: u16, offset: u16, value: u32) -> Result<(), CpuFault> {
        self.segment_mut(selector)?.write_dword(offset, value);
        Ok(())
    }

    pub fn set_array(&mut self, selector: u16, offset: u16, bytes: &[u8]) -> Result<(), CpuFault> {
        self.segment_mut(selector)?.write_array(offset, bytes);
        Ok(())
    }

    /// Decoded instruction at `selector:offset`, from the per-segment cache.
    pub fn instruction_at(
        &mut self,
        selector: u16,
        offset: u16,
    ) -> Result<DecodedInstruction, CpuFault> {
        let segment = self.segment_mut(selector)?;
        segment.instruction_at(offset).ok_or_else(|| {
            let mut bytes = [0u8; 8];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = segment.read_byte(offset.wrapping_add(i as u16));
            }
            CpuFault::DecodeFailure {
                segment: selector,
                offset,
                bytes,
            }
        })
    }
}

impl Default for MemoryCore {
    fn default() -> Self {
        Self::new()
    }
}
