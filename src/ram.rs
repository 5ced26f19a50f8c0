//! RAM-backed NOR flash used by the simulator and tests.

use std::vec::Vec;

use crate::error::ErrorKind;
use crate::storage::{FlashError, Geometry, Storage, WordAddr};
use crate::util::BLANK_WORD;
use log::error;
use zerocopy::{AsBytes, FromBytes};

const IMAGE_MAGIC: [u8; 4] = *b"FDSK";

const IMAGE_VERSION: u32 = 0;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_CKSUM);

/// Header in front of a saved flash image. Fields and words are stored in host byte order.
#[derive(Debug, AsBytes, FromBytes, Clone, Default)]
#[repr(C)]
struct ImageHeader {
    magic: [u8; 4],
    version: u32,
    base: u32,
    num_words: u32,
    crc: u32,
}

/// Flash simulated in RAM.
///
/// Programming can only clear bits, so programming over data that was not erased leaves a mix
/// of both values and fails verification just like the real part.
pub struct RamFlash {
    base: WordAddr,
    words: Vec<u16>,
    sectors: Vec<(WordAddr, usize)>,
    busy_polls: u32,
    busy_remaining: u32,
    fail_erase: bool,
    fail_program: bool,
    lose_program: bool,
    erase_count: usize,
    program_count: usize,
}

impl RamFlash {
    /// Blank flash covering `num_words` from `base`, without any erasable sectors.
    pub fn new(base: WordAddr, num_words: usize) -> Self {
        RamFlash {
            base,
            words: std::vec![BLANK_WORD; num_words],
            sectors: Vec::new(),
            busy_polls: 0,
            busy_remaining: 0,
            fail_erase: false,
            fail_program: false,
            lose_program: false,
            erase_count: 0,
            program_count: 0,
        }
    }

    /// Blank flash laid out with the disk sectors and the password sector of `geometry`.
    pub fn for_geometry(geometry: &Geometry) -> Self {
        let (start, end) = geometry.span();
        let mut flash = RamFlash::new(start, end.0 - start.0);
        for sector in 0..geometry.num_sectors() {
            flash.add_sector(geometry.sector_addr(sector), geometry.sector_words);
        }
        flash.add_sector(geometry.password_base, geometry.password_sector_words);
        flash
    }

    pub fn add_sector(&mut self, addr: WordAddr, num_words: usize) {
        self.sectors.push((addr, num_words));
    }

    /// Report busy for `polls` ready checks after every erase or program.
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    pub fn fail_next_erase(&mut self) {
        self.fail_erase = true;
    }

    pub fn fail_next_program(&mut self) {
        self.fail_program = true;
    }

    /// The next program reports success without touching the array.
    pub fn lose_next_program(&mut self) {
        self.lose_program = true;
    }

    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    pub fn program_count(&self) -> usize {
        self.program_count
    }

    fn index(&self, addr: WordAddr, num_words: usize) -> Result<usize, FlashError> {
        let idx = addr.0.checked_sub(self.base.0).ok_or(FlashError::OutOfRange)?;
        if idx + num_words > self.words.len() {
            return Err(FlashError::OutOfRange);
        }
        Ok(idx)
    }

    pub fn to_image(&self) -> Vec<u8> {
        let words = self.words.as_slice().as_bytes();
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            base: self.base.0 as u32,
            num_words: self.words.len() as u32,
            crc: CRC.checksum(words),
        };
        let mut image = Vec::with_capacity(core::mem::size_of::<ImageHeader>() + words.len());
        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(words);
        image
    }

    /// Restore flash saved by [`RamFlash::to_image`]; it must match the layout of `geometry`.
    pub fn from_image(image: &[u8], geometry: &Geometry) -> Result<Self, ErrorKind> {
        let header_len = core::mem::size_of::<ImageHeader>();
        if image.len() < header_len {
            error!("image shorter than its header: {} bytes", image.len());
            return Err(ErrorKind::CorruptImage);
        }
        let mut header = ImageHeader::default();
        header.as_bytes_mut().copy_from_slice(&image[..header_len]);
        if header.magic != IMAGE_MAGIC || header.version != IMAGE_VERSION {
            error!("image magic or version mismatch");
            return Err(ErrorKind::CorruptImage);
        }

        let mut flash = RamFlash::for_geometry(geometry);
        let body = &image[header_len..];
        if header.base as usize != flash.base.0
            || header.num_words as usize != flash.words.len()
            || body.len() != flash.words.len() * 2
        {
            error!(
                "image layout base: 0x{:x} words: 0x{:x} does not match geometry",
                header.base, header.num_words
            );
            return Err(ErrorKind::InvalidGeometry);
        }
        if CRC.checksum(body) != header.crc {
            error!("image crc mismatch");
            return Err(ErrorKind::CorruptImage);
        }
        flash.words.as_mut_slice().as_bytes_mut().copy_from_slice(body);
        Ok(flash)
    }
}

impl Storage for RamFlash {
    fn read(&self, addr: WordAddr, data: &mut [u16]) {
        let idx = addr.0 - self.base.0;
        data.copy_from_slice(&self.words[idx..idx + data.len()]);
    }

    fn erase(&mut self, addr: WordAddr) -> Result<(), FlashError> {
        if core::mem::take(&mut self.fail_erase) {
            return Err(FlashError::Erase);
        }
        let (_, num_words) = *self
            .sectors
            .iter()
            .find(|(start, _)| *start == addr)
            .ok_or(FlashError::Erase)?;
        let idx = self.index(addr, num_words)?;
        self.words[idx..idx + num_words].fill(BLANK_WORD);
        self.erase_count += 1;
        self.busy_remaining = self.busy_polls;
        Ok(())
    }

    fn program(&mut self, addr: WordAddr, data: &[u16]) -> Result<(), FlashError> {
        if core::mem::take(&mut self.fail_program) {
            return Err(FlashError::Program);
        }
        let idx = self.index(addr, data.len())?;
        self.program_count += 1;
        self.busy_remaining = self.busy_polls;
        if core::mem::take(&mut self.lose_program) {
            return Ok(());
        }
        for (word, new) in self.words[idx..idx + data.len()].iter_mut().zip(data) {
            *word &= *new;
        }
        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        if self.busy_remaining == 0 {
            return true;
        }
        self.busy_remaining -= 1;
        false
    }
}
