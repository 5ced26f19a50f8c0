use crate::error::ErrorKind;
use crate::password::RECORD_WORDS;
use crate::util::BLANK_WORD;

/// Address of a 16-bit word in the flash address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WordAddr(pub usize);

impl WordAddr {
    pub const fn offset(self, num_words: usize) -> WordAddr {
        WordAddr(self.0 + num_words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    Init,
    Erase,
    BlankCheck { addr: WordAddr },
    Program,
    Verify { addr: WordAddr },
    Timeout,
    OutOfRange,
}

/// Layout of the flash owned by the disk.
///
/// Disk and block sizes count host bytes, sector and record sizes count flash words. One word
/// carries two host bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub disk_base: WordAddr,
    pub disk_bytes: usize,
    pub sector_words: usize,
    pub block_bytes: usize,
    pub transfer_bytes: usize,
    pub program_chunk_words: usize,
    pub password_base: WordAddr,
    pub password_sector_words: usize,
}

impl Geometry {
    /// Five 32K-word sectors of bank 0 followed by the 8K-word password sector.
    pub const F2837X: Geometry = Geometry {
        disk_base: WordAddr(0x09_0000),
        disk_bytes: 0x5_0000,
        sector_words: 0x8000,
        block_bytes: 0x1000,
        transfer_bytes: 64,
        program_chunk_words: 8,
        password_base: WordAddr(0x0B_8000),
        password_sector_words: 0x2000,
    };

    pub fn validate(&self) -> Result<(), ErrorKind> {
        let sector_bytes = self.sector_bytes();
        let valid = self.sector_words > 0
            && self.block_bytes > 0
            && self.transfer_bytes > 0
            && self.program_chunk_words > 0
            && self.block_bytes % 2 == 0
            && self.disk_bytes % sector_bytes == 0
            && sector_bytes % self.block_bytes == 0
            && self.block_bytes % self.transfer_bytes == 0
            && self.sector_words % self.program_chunk_words == 0
            && RECORD_WORDS % self.program_chunk_words == 0
            && RECORD_WORDS <= self.password_sector_words;
        if !valid {
            return Err(ErrorKind::InvalidGeometry);
        }

        let disk_end = self.disk_base.offset(self.disk_words());
        let password_end = self.password_base.offset(self.password_sector_words);
        if self.password_base < disk_end && self.disk_base < password_end {
            return Err(ErrorKind::InvalidGeometry);
        }
        Ok(())
    }

    pub const fn sector_bytes(&self) -> usize {
        self.sector_words * 2
    }

    pub const fn disk_words(&self) -> usize {
        self.disk_bytes / 2
    }

    pub const fn num_sectors(&self) -> usize {
        self.disk_words() / self.sector_words
    }

    pub const fn num_blocks(&self) -> usize {
        self.disk_bytes / self.block_bytes
    }

    pub const fn sector_addr(&self, sector: usize) -> WordAddr {
        self.disk_base.offset(sector * self.sector_words)
    }

    /// Lowest and highest word address covered by this geometry.
    pub fn span(&self) -> (WordAddr, WordAddr) {
        let disk_end = self.disk_base.offset(self.disk_words());
        let password_end = self.password_base.offset(self.password_sector_words);
        (
            core::cmp::min(self.disk_base, self.password_base),
            core::cmp::max(disk_end, password_end),
        )
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::F2837X
    }
}

const CHECK_CHUNK_WORDS: usize = 64;

/// Upper bound on ready polls before a flash operation is declared stuck.
pub(crate) const BUSY_POLL_LIMIT: u32 = 1_000_000;

/// Word-addressed NOR flash controller.
///
/// Erase and program are blocking: the controller may report busy afterwards and callers poll
/// [`Storage::is_ready`] until the state machine settles.
pub trait Storage {
    fn init(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn read(&self, addr: WordAddr, data: &mut [u16]);

    /// Erase the sector starting at `addr`.
    fn erase(&mut self, addr: WordAddr) -> Result<(), FlashError>;

    fn program(&mut self, addr: WordAddr, data: &[u16]) -> Result<(), FlashError>;

    fn is_ready(&mut self) -> bool;

    fn blank_check(&self, addr: WordAddr, num_words: usize) -> Result<(), FlashError> {
        let mut buf = [0u16; CHECK_CHUNK_WORDS];
        let mut pos = 0;
        while pos < num_words {
            let nwords = core::cmp::min(CHECK_CHUNK_WORDS, num_words - pos);
            self.read(addr.offset(pos), &mut buf[..nwords]);
            if let Some(idx) = buf[..nwords].iter().position(|w| *w != BLANK_WORD) {
                return Err(FlashError::BlankCheck {
                    addr: addr.offset(pos + idx),
                });
            }
            pos += nwords;
        }
        Ok(())
    }

    fn verify(&self, addr: WordAddr, data: &[u16]) -> Result<(), FlashError> {
        let mut buf = [0u16; CHECK_CHUNK_WORDS];
        for (i, expected) in data.chunks(CHECK_CHUNK_WORDS).enumerate() {
            let chunk_addr = addr.offset(i * CHECK_CHUNK_WORDS);
            let actual = &mut buf[..expected.len()];
            self.read(chunk_addr, actual);
            if let Some(idx) = actual.iter().zip(expected).position(|(a, e)| a != e) {
                return Err(FlashError::Verify {
                    addr: chunk_addr.offset(idx),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn wait_ready<T: Storage>(storage: &mut T) -> Result<(), FlashError> {
    for _ in 0..BUSY_POLL_LIMIT {
        if storage.is_ready() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(FlashError::Timeout)
}

/// Erase the sector at `addr` and confirm every word reads back blank.
pub(crate) fn erase_sector<T: Storage>(
    storage: &mut T,
    addr: WordAddr,
    num_words: usize,
) -> Result<(), FlashError> {
    storage.erase(addr)?;
    wait_ready(storage)?;
    storage.blank_check(addr, num_words)
}

/// Program `data` at `addr` in chunks of `chunk_words`, verifying each chunk right after it lands.
pub(crate) fn program_verified<T: Storage>(
    storage: &mut T,
    addr: WordAddr,
    data: &[u16],
    chunk_words: usize,
) -> Result<(), FlashError> {
    for (i, chunk) in data.chunks(chunk_words).enumerate() {
        let chunk_addr = addr.offset(i * chunk_words);
        storage.program(chunk_addr, chunk)?;
        wait_ready(storage)?;
        storage.verify(chunk_addr, chunk)?;
    }
    Ok(())
}
