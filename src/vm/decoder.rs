//! 16-bit instruction decoding.
//!
//! The crate uses `iced-x86` as the underlying decoder; this module keeps a
//! small wrapper record so the rest of the core carries the constant offsets
//! (needed for relocation lookups against immediate and displacement slots)
//! next to the decoded instruction.

use std::collections::HashMap;

use iced_x86::{ConstantOffsets, Decoder, DecoderOptions, Instruction};

/// Word value the NE loader leaves in every slot that needs a fix-up.
pub const RELOC_SENTINEL: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    pub offsets: ConstantOffsets,
}

impl DecodedInstruction {
    #[inline]
    pub fn len(&self) -> u16 {
        self.instruction.len() as u16
    }
}

/// Linearly decode a whole code segment, keyed by byte offset. Offsets the
/// linear pass reads as operand bytes stay absent; `decode_at` fills them on
/// demand when a branch actually lands there.
pub fn decode_segment(bytes: &[u8]) -> HashMap<u16, DecodedInstruction> {
    let mut cache = HashMap::new();
    let mut decoder = Decoder::with_ip(16, bytes, 0, DecoderOptions::NONE);
    while decoder.can_decode() {
        let position = decoder.ip() as u16;
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            // The decoder already advanced past the bytes it rejected.
            continue;
        }
        let offsets = decoder.get_constant_offsets(&instruction);
        cache.insert(
            position,
            DecodedInstruction {
                instruction,
                offsets,
            },
        );
    }
    cache
}

/// Decode the single instruction starting at `offset`.
pub fn decode_at(bytes: &[u8], offset: u16) -> Option<DecodedInstruction> {
    let slice = bytes.get(offset as usize..)?;
    let mut decoder = Decoder::with_ip(16, slice, offset as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    let offsets = decoder.get_constant_offsets(&instruction);
    Some(DecodedInstruction {
        instruction,
        offsets,
    })
}
