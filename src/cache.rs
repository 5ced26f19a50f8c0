use core::ops::Range;

use crate::storage::{Storage, WordAddr};
use crate::util::{set_word_byte, BLANK_WORD};
use log::trace;

/// RAM mirror of the one sector currently being rewritten.
pub(crate) struct SectorCache<'c> {
    words: &'c mut [u16],
    sector: Option<usize>,
    erase_needed: bool,
}

impl<'c> SectorCache<'c> {
    pub(crate) fn new(words: &'c mut [u16]) -> Self {
        SectorCache {
            words,
            sector: None,
            erase_needed: false,
        }
    }

    pub(crate) fn holds(&self, sector: usize) -> bool {
        self.sector == Some(sector)
    }

    pub(crate) fn erase_needed(&self) -> bool {
        self.erase_needed
    }

    pub(crate) fn words(&self) -> &[u16] {
        &self.words[..]
    }

    /// Drop the cached sector.
    pub(crate) fn reset(&mut self) {
        self.sector = None;
        self.erase_needed = false;
    }

    /// Copy a whole sector out of flash. The erase decision starts over for the new sector.
    pub(crate) fn load<T: Storage>(&mut self, storage: &T, addr: WordAddr, sector: usize) {
        trace!("cache load sector: {} addr: 0x{:x}", sector, addr.0);
        storage.read(addr, &mut self.words[..]);
        self.sector = Some(sector);
        self.erase_needed = false;
    }

    /// Flag an erase if any word in `range` has been programmed.
    pub(crate) fn scan(&mut self, range: Range<usize>) {
        if self.words[range].iter().any(|w| *w != BLANK_WORD) {
            self.erase_needed = true;
        }
    }

    /// Merge host bytes starting at byte `offset` of the sector.
    pub(crate) fn merge(&mut self, offset: usize, data: &[u8]) {
        trace!("cache merge offset: {} len: {}", offset, data.len());
        for (i, byte) in data.iter().enumerate() {
            let pos = offset + i;
            set_word_byte(&mut self.words[pos / 2], pos, *byte);
        }
    }
}
