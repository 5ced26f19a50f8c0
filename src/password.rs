use crate::storage::{Storage, WordAddr};
use crate::util::{c_str, BLANK_WORD};

/// Size of the persisted password slot in words.
pub(crate) const RECORD_WORDS: usize = 32;

/// Longest secret the slot holds; the last word stays NUL.
pub const MAX_SECRET_LEN: usize = RECORD_WORDS - 1;

/// Persisted password slot: one secret byte per word, NUL-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PasswordRecord {
    chars: [u16; RECORD_WORDS],
}

impl PasswordRecord {
    pub(crate) fn load<T: Storage>(storage: &T, addr: WordAddr) -> Self {
        let mut record = PasswordRecord {
            chars: [BLANK_WORD; RECORD_WORDS],
        };
        storage.read(addr, &mut record.chars);
        record
    }

    /// Record for the C-string at the front of `secret`, truncated to [`MAX_SECRET_LEN`].
    pub(crate) fn from_secret(secret: &[u8]) -> Self {
        let secret = c_str(secret);
        let len = core::cmp::min(secret.len(), MAX_SECRET_LEN);
        let mut chars = [0u16; RECORD_WORDS];
        for (c, b) in chars.iter_mut().zip(&secret[..len]) {
            *c = *b as u16;
        }
        PasswordRecord { chars }
    }

    pub(crate) fn words(&self) -> &[u16] {
        &self.chars
    }

    /// No password is configured.
    pub(crate) fn is_empty(&self) -> bool {
        self.chars[0] == BLANK_WORD
    }

    /// Every word of the slot is erased, so it can be programmed without an erase.
    pub(crate) fn is_blank(&self) -> bool {
        self.chars.iter().all(|c| *c == BLANK_WORD)
    }

    pub(crate) fn secret_len(&self) -> usize {
        self.chars
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(RECORD_WORDS)
    }

    fn char_at(&self, idx: usize) -> u16 {
        self.chars.get(idx).copied().unwrap_or(0)
    }

    /// Host form: the C-string in `candidate` equals the secret.
    pub(crate) fn matches_command(&self, candidate: &[u8]) -> bool {
        let candidate = c_str(candidate);
        candidate.len() == self.secret_len()
            && candidate
                .iter()
                .zip(&self.chars)
                .all(|(b, c)| *b as u16 == *c)
    }

    /// Flash form: `packed` starts with the secret two bytes per word, NUL padded to a whole word.
    pub(crate) fn matches_packed(&self, packed: &[u16]) -> bool {
        let len = self.secret_len();
        let num_words = (len + 1) / 2;
        if packed.len() < num_words {
            return false;
        }
        packed[..num_words].iter().enumerate().all(|(i, word)| {
            self.char_at(2 * i) == (word & 0xFF) && self.char_at(2 * i + 1) == (word >> 8)
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn packed(bytes: &[u8]) -> std::vec::Vec<u16> {
        bytes
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
            .collect()
    }

    #[test]
    fn blank_slot_is_empty() {
        let record = PasswordRecord {
            chars: [BLANK_WORD; RECORD_WORDS],
        };
        assert!(record.is_empty());
        assert!(record.is_blank());
    }

    #[test]
    fn secret_stops_at_nul() {
        let record = PasswordRecord::from_secret(b"hunter2\0trailing");
        assert_eq!(record.secret_len(), 7);
        assert_eq!(record.words()[0], b'h' as u16);
        assert_eq!(record.words()[7], 0);
        assert!(!record.is_empty());
    }

    #[test]
    fn long_secret_is_truncated() {
        let record = PasswordRecord::from_secret(&[b'x'; 40]);
        assert_eq!(record.secret_len(), MAX_SECRET_LEN);
        assert_eq!(record.words()[MAX_SECRET_LEN], 0);
    }

    #[test]
    fn command_form_needs_exact_match() {
        let record = PasswordRecord::from_secret(b"hunter2");
        assert!(record.matches_command(b"hunter2"));
        assert!(record.matches_command(b"hunter2\0junk"));
        assert!(!record.matches_command(b"hunter"));
        assert!(!record.matches_command(b"hunter22"));
        assert!(!record.matches_command(b"hunteR2"));
    }

    #[test]
    fn packed_form_matches_padded_secret() {
        let odd = PasswordRecord::from_secret(b"abc");
        assert!(odd.matches_packed(&packed(b"abc\0")));
        assert!(!odd.matches_packed(&packed(b"abcd")));

        let even = PasswordRecord::from_secret(b"abcd");
        assert!(even.matches_packed(&packed(b"abcd")));
        assert!(even.matches_packed(&packed(b"abcdef")));
        assert!(!even.matches_packed(&packed(b"abce")));
        assert!(!even.matches_packed(&packed(b"ab")));
    }
}
