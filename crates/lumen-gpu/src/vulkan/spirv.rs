//! Minimal SPIR-V inspection.

use std::io::Cursor;

const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;
const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;

/// Decode a SPIR-V binary into words, fixing endianness.
///
/// Returns `None` if the image is truncated or lacks the SPIR-V magic.
pub fn words_from_bytes(bytes: &[u8]) -> Option<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).ok()?;
    (words.len() >= HEADER_WORDS && words[0] == MAGIC).then_some(words)
}

/// Names of the compute entry points declared in a module.
///
/// Returns `None` on a malformed instruction stream.
pub fn entry_points(words: &[u32]) -> Option<Vec<String>> {
    let mut names = Vec::new();
    let mut offset = HEADER_WORDS;

    while offset < words.len() {
        let word = words[offset];
        let count = (word >> 16) as usize;
        let opcode = word & 0xffff;
        if count == 0 {
            return None;
        }
        let operands = words.get(offset + 1..offset + count)?;

        if opcode == OP_ENTRY_POINT
            && operands.len() >= 3
            && operands[0] == EXECUTION_MODEL_GL_COMPUTE
        {
            names.push(literal_string(&operands[2..])?);
        }
        offset += count;
    }

    Some(names)
}

/// Decode a nul-terminated literal packed into little-endian words.
fn literal_string(words: &[u32]) -> Option<String> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let end = bytes.iter().position(|&b| b == 0)?;
    String::from_utf8(bytes[..end].to_vec()).ok()
}
