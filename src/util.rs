/// Value of an erased flash word.
pub(crate) const BLANK_WORD: u16 = 0xFFFF;

/// Prefix that introduces a password, both in host write buffers and on flash.
pub const UNLOCK_TAG: [u8; 8] = *b"UNL0CKK:";

/// [`UNLOCK_TAG`] as it appears on flash, two bytes per word.
pub(crate) const MARKER_WORDS: [u16; 4] = [
    u16::from_le_bytes([UNLOCK_TAG[0], UNLOCK_TAG[1]]),
    u16::from_le_bytes([UNLOCK_TAG[2], UNLOCK_TAG[3]]),
    u16::from_le_bytes([UNLOCK_TAG[4], UNLOCK_TAG[5]]),
    u16::from_le_bytes([UNLOCK_TAG[6], UNLOCK_TAG[7]]),
];

/// Byte `byte_idx` of the host stream, taken from the word that holds it.
pub(crate) fn word_byte(word: u16, byte_idx: usize) -> u8 {
    if byte_idx % 2 == 0 {
        (word & 0xFF) as u8
    } else {
        (word >> 8) as u8
    }
}

pub(crate) fn set_word_byte(word: &mut u16, byte_idx: usize, byte: u8) {
    if byte_idx % 2 == 0 {
        *word = (*word & 0xFF00) | byte as u16;
    } else {
        *word = (*word & 0x00FF) | ((byte as u16) << 8);
    }
}

/// The bytes before the first NUL, or all of them.
pub(crate) fn c_str(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}
