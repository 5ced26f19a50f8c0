use crate::cache::SectorCache;
use crate::storage::{erase_sector, program_verified, FlashError, Geometry, Storage};
use crate::util::word_byte;
use log::{debug, trace, warn};

const READ_CHUNK_WORDS: usize = 32;

/// Maps host byte positions onto flash words and folds block writes into whole-sector programs.
///
/// A block write is expected to arrive in increasing offset order. The first piece of a block
/// (offset zero) pulls the owning sector into the cache and decides whether that block needs an
/// erase. The piece that finishes the block commits the whole sector back to flash. A piece for
/// any block other than the one being gathered drops the partial block and starts over.
pub(crate) struct Ftl<'c> {
    geometry: Geometry,
    cache: SectorCache<'c>,
    /// Block whose pieces the cache is gathering.
    pending: Option<usize>,
}

impl<'c> Ftl<'c> {
    pub(crate) fn new(geometry: Geometry, cache: SectorCache<'c>) -> Self {
        Ftl {
            geometry,
            cache,
            pending: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.cache.reset();
        self.pending = None;
    }

    /// Byte position of `offset` within `block`, if `len` bytes from there stay on the disk.
    pub(crate) fn resolve(&self, block: u32, offset: u32, len: usize) -> Option<usize> {
        let start = (block as usize)
            .checked_mul(self.geometry.block_bytes)?
            .checked_add(offset as usize)?;
        let end = start.checked_add(len)?;
        if end <= self.geometry.disk_bytes {
            Some(start)
        } else {
            None
        }
    }

    /// Copy disk bytes starting at `start` straight from flash.
    pub(crate) fn read<T: Storage>(&self, storage: &T, start: usize, data: &mut [u8]) {
        let end = start + data.len();
        let mut buf = [0u16; READ_CHUNK_WORDS];
        let mut pos = start;
        while pos < end {
            let first_word = pos / 2;
            let last_word = (end - 1) / 2;
            let num_words = core::cmp::min(READ_CHUNK_WORDS, last_word - first_word + 1);
            storage.read(
                self.geometry.disk_base.offset(first_word),
                &mut buf[..num_words],
            );
            let chunk_end = core::cmp::min(end, (first_word + num_words) * 2);
            for byte in pos..chunk_end {
                data[byte - start] = word_byte(buf[byte / 2 - first_word], byte);
            }
            pos = chunk_end;
        }
    }

    /// Write disk bytes starting at `start`, one block-bounded piece at a time.
    pub(crate) fn write<T: Storage>(
        &mut self,
        storage: &mut T,
        start: usize,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let block_bytes = self.geometry.block_bytes;
        let mut pos = 0;
        while pos < data.len() {
            let in_block = (start + pos) % block_bytes;
            let num_bytes = core::cmp::min(block_bytes - in_block, data.len() - pos);
            self.write_piece(storage, start + pos, &data[pos..pos + num_bytes])?;
            pos += num_bytes;
        }
        Ok(())
    }

    fn write_piece<T: Storage>(
        &mut self,
        storage: &mut T,
        start: usize,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let sector_bytes = self.geometry.sector_bytes();
        let block_bytes = self.geometry.block_bytes;
        let sector = start / sector_bytes;
        let block = start / block_bytes;
        let in_sector = start % sector_bytes;
        let in_block = start % block_bytes;

        if in_block == 0 || self.pending != Some(block) || !self.cache.holds(sector) {
            if in_block != 0 {
                warn!(
                    "block {} write at offset {} without its start, pending block: {:?}",
                    block, in_block, self.pending
                );
            }
            self.cache
                .load(storage, self.geometry.sector_addr(sector), sector);
            let block_end = in_sector - in_block + block_bytes;
            self.cache.scan(in_sector / 2..block_end / 2);
            self.pending = Some(block);
        }

        self.cache.merge(in_sector, data);

        if in_block + data.len() == block_bytes {
            let result = self.commit(storage, sector);
            self.reset();
            result?;
        }
        Ok(())
    }

    fn commit<T: Storage>(&mut self, storage: &mut T, sector: usize) -> Result<(), FlashError> {
        let addr = self.geometry.sector_addr(sector);
        if self.cache.erase_needed() {
            debug!("erase sector: {} addr: 0x{:x}", sector, addr.0);
            erase_sector(storage, addr, self.geometry.sector_words)?;
        }
        debug!("program sector: {} addr: 0x{:x}", sector, addr.0);
        program_verified(
            storage,
            addr,
            self.cache.words(),
            self.geometry.program_chunk_words,
        )?;
        trace!("sector {} committed", sector);
        Ok(())
    }
}
