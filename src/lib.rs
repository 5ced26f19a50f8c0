//! Password-gated block device on top of word-addressed NOR flash.
//!
//! [`FlashDisk`] is what a USB mass storage front end talks to: it opens the drive, serves
//! block reads and writes, and answers the sector count and size queries. Writes are gathered
//! a sector at a time in a caller-provided cache and only erased when the target block already
//! holds data. Until the drive is unlocked reads return zeros and writes are treated as unlock
//! attempts.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod cache;
mod error;
mod ftl;
mod gate;
mod password;
#[cfg(any(test, feature = "std"))]
pub mod ram;
mod storage;
#[cfg(test)]
mod tests_util;
mod util;

pub use error::ErrorKind;
pub use password::MAX_SECRET_LEN;
pub use storage::{FlashError, Geometry, Storage, WordAddr};
pub use util::UNLOCK_TAG;

use cache::SectorCache;
use ftl::Ftl;
use gate::AccessGate;
use log::{error, info, warn};

/// `ioctl` command: number of blocks on the drive.
pub const GET_SECTOR_COUNT: u32 = 1;

/// `ioctl` command: size of one block in bytes.
pub const GET_SECTOR_SIZE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveFlags(u32);

impl DriveFlags {
    pub const PRESENT: DriveFlags = DriveFlags(0x1);
    pub const IN_USE: DriveFlags = DriveFlags(0x2);

    pub const fn empty() -> Self {
        DriveFlags(0)
    }

    pub const fn union(self, other: DriveFlags) -> Self {
        DriveFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: DriveFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Idle,
    NotPresent,
}

pub struct FlashDisk<'c, T: Storage> {
    storage: T,
    geometry: Geometry,
    ftl: Ftl<'c>,
    gate: AccessGate,
    flags: DriveFlags,
    fault: Option<FlashError>,
}

impl<'c, T: Storage> FlashDisk<'c, T> {
    /// Build a closed drive. `cache` backs the sector cache and must hold one sector of words.
    pub fn new(storage: T, geometry: Geometry, cache: &'c mut [u16]) -> Result<Self, ErrorKind> {
        geometry.validate()?;
        if cache.len() < geometry.sector_words {
            return Err(ErrorKind::BufferTooSmall);
        }
        let cache = SectorCache::new(&mut cache[..geometry.sector_words]);
        Ok(FlashDisk {
            storage,
            geometry,
            ftl: Ftl::new(geometry, cache),
            gate: AccessGate::new(),
            flags: DriveFlags::empty(),
            fault: None,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn storage(&self) -> &T {
        &self.storage
    }

    pub fn into_storage(self) -> T {
        self.storage
    }

    /// Open drive `drive`, bringing up flash and deriving the lock state from its contents.
    ///
    /// Reopening clears a fault left by an earlier write.
    pub fn open(&mut self, drive: u32) -> Result<(), ErrorKind> {
        if drive != 0 {
            return Err(ErrorKind::UnknownDrive);
        }
        self.storage.init()?;
        self.ftl.reset();
        self.fault = None;
        self.gate.initialize(&self.storage, &self.geometry);
        self.flags = DriveFlags::PRESENT.union(DriveFlags::IN_USE);
        info!(
            "drive {} open, {} blocks of {} bytes",
            drive,
            self.geometry.num_blocks(),
            self.geometry.block_bytes
        );
        Ok(())
    }

    /// Close the drive. Nothing is flushed: a block left half written stays uncommitted.
    pub fn close(&mut self) {
        self.flags = DriveFlags::empty();
        info!("drive closed");
    }

    pub fn flags(&self) -> DriveFlags {
        self.flags
    }

    pub fn is_open(&self) -> bool {
        self.flags.contains(DriveFlags::IN_USE)
    }

    pub fn status(&self) -> DriveStatus {
        if self.flags.contains(DriveFlags::PRESENT) {
            DriveStatus::Idle
        } else {
            DriveStatus::NotPresent
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.gate.is_unlocked()
    }

    pub fn fault(&self) -> Option<FlashError> {
        self.fault
    }

    fn ensure_open(&self) -> Result<(), ErrorKind> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ErrorKind::NotOpen)
        }
    }

    fn request_len(&self, unit_count: u32) -> Result<usize, ErrorKind> {
        (unit_count as usize)
            .checked_mul(self.geometry.transfer_bytes)
            .ok_or(ErrorKind::BufferTooSmall)
    }

    fn record_fault(&mut self, err: FlashError) -> ErrorKind {
        error!("flash fault: {:?}, drive refuses writes until reopened", err);
        self.fault = Some(err);
        ErrorKind::StorageFault(err)
    }

    /// Read `unit_count` transfers starting `offset` bytes into `block`.
    ///
    /// Returns the requested length even when nothing was copied: a locked drive fills the
    /// buffer with zeros, and a range past the end of the disk leaves the buffer untouched.
    pub fn read(
        &self,
        buf: &mut [u8],
        block: u32,
        offset: u32,
        unit_count: u32,
    ) -> Result<usize, ErrorKind> {
        self.ensure_open()?;
        let len = self.request_len(unit_count)?;
        let data = buf.get_mut(..len).ok_or(ErrorKind::BufferTooSmall)?;

        if !self.gate.is_unlocked() {
            data.fill(0);
            return Ok(len);
        }

        match self.ftl.resolve(block, offset, len) {
            Some(start) => self.ftl.read(&self.storage, start, data),
            None => warn!(
                "read past end of disk, block: {} offset: {} len: {}",
                block, offset, len
            ),
        }
        Ok(len)
    }

    /// Write `unit_count` transfers starting `offset` bytes into `block`.
    ///
    /// On a locked drive the data is never stored. A write that ends exactly on a block
    /// boundary is taken as an unlock attempt, anything else is dropped. On an unlocked drive a
    /// buffer starting with [`UNLOCK_TAG`] also replaces the password before being stored.
    pub fn write(
        &mut self,
        buf: &[u8],
        block: u32,
        offset: u32,
        unit_count: u32,
    ) -> Result<usize, ErrorKind> {
        self.ensure_open()?;
        if let Some(err) = self.fault {
            return Err(ErrorKind::Faulted(err));
        }
        let len = self.request_len(unit_count)?;
        let data = buf.get(..len).ok_or(ErrorKind::BufferTooSmall)?;

        if !self.gate.is_unlocked() {
            if (offset as usize).checked_add(len) == Some(self.geometry.block_bytes) {
                self.gate
                    .attempt_unlock(&self.storage, &self.geometry, data);
            }
            return Ok(len);
        }

        if let Some(secret) = data.strip_prefix(&UNLOCK_TAG[..]) {
            if let Err(err) = self
                .gate
                .set_password(&mut self.storage, &self.geometry, secret)
            {
                return Err(self.record_fault(err));
            }
        }

        match self.ftl.resolve(block, offset, len) {
            Some(start) => {
                if let Err(err) = self.ftl.write(&mut self.storage, start, data) {
                    return Err(self.record_fault(err));
                }
            }
            None => warn!(
                "write past end of disk dropped, block: {} offset: {} len: {}",
                block, offset, len
            ),
        }
        Ok(len)
    }

    /// Answer a disk control query. Unknown drives and commands yield `None`.
    pub fn ioctl(&self, drive: u32, command: u32) -> Option<u32> {
        if drive != 0 {
            return None;
        }
        match command {
            GET_SECTOR_COUNT => Some(self.geometry.num_blocks() as u32),
            GET_SECTOR_SIZE => Some(self.geometry.block_bytes as u32),
            _ => None,
        }
    }

    pub fn num_blocks(&self) -> u32 {
        self.ioctl(0, GET_SECTOR_COUNT).unwrap_or(0)
    }

    pub fn block_size(&self) -> u32 {
        self.ioctl(0, GET_SECTOR_SIZE).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ram::RamFlash;
    use crate::tests_util::*;

    fn set_password(disk: &mut FlashDisk<'static, RamFlash>, block: u32, secret: &[u8]) {
        let mut data = std::vec![0u8; disk.geometry().block_bytes];
        data[..UNLOCK_TAG.len()].copy_from_slice(&UNLOCK_TAG);
        data[UNLOCK_TAG.len()..UNLOCK_TAG.len() + secret.len()].copy_from_slice(secret);
        write_block(disk, block, &data);
    }

    /// Unlock attempt as a host sends it: the tail transfer of a block.
    fn try_unlock(disk: &mut FlashDisk<'static, RamFlash>, secret: &[u8]) -> bool {
        let transfer = disk.geometry().transfer_bytes;
        let mut data = std::vec![0u8; transfer];
        data[..UNLOCK_TAG.len()].copy_from_slice(&UNLOCK_TAG);
        data[UNLOCK_TAG.len()..UNLOCK_TAG.len() + secret.len()].copy_from_slice(secret);
        let offset = (disk.geometry().block_bytes - transfer) as u32;
        disk.write(&data, 0, offset, 1).unwrap();
        disk.is_unlocked()
    }

    #[test]
    fn fresh_drive_opens_unlocked() {
        init();
        let mut disk = make_disk(SMALL);
        assert_eq!(disk.status(), DriveStatus::NotPresent);
        disk.open(0).unwrap();
        assert!(disk.is_unlocked());
        assert_eq!(disk.status(), DriveStatus::Idle);
        assert_eq!(
            disk.flags(),
            DriveFlags::PRESENT.union(DriveFlags::IN_USE)
        );
    }

    #[test]
    fn only_drive_zero_exists() {
        let mut disk = make_disk(SMALL);
        assert_eq!(disk.open(1), Err(ErrorKind::UnknownDrive));
        assert_eq!(disk.ioctl(1, GET_SECTOR_COUNT), None);
    }

    #[test]
    fn io_requires_open_drive() {
        let mut disk = make_disk(SMALL);
        let mut buf = [0u8; 64];
        assert_eq!(disk.read(&mut buf, 0, 0, 1), Err(ErrorKind::NotOpen));
        assert_eq!(disk.write(&buf, 0, 0, 1), Err(ErrorKind::NotOpen));

        disk.open(0).unwrap();
        disk.close();
        assert_eq!(disk.flags(), DriveFlags::empty());
        assert_eq!(disk.read(&mut buf, 0, 0, 1), Err(ErrorKind::NotOpen));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        let mut buf = [0u8; 63];
        assert_eq!(disk.read(&mut buf, 0, 0, 1), Err(ErrorKind::BufferTooSmall));
        assert_eq!(disk.write(&buf, 0, 0, 1), Err(ErrorKind::BufferTooSmall));
    }

    #[test]
    fn cache_must_hold_a_sector() {
        let mut cache = [0u16; 16];
        assert_eq!(
            FlashDisk::new(RamFlash::for_geometry(&SMALL), SMALL, &mut cache).err(),
            Some(ErrorKind::BufferTooSmall)
        );
    }

    #[test]
    fn block_round_trip() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        let txt = rust_counter_strings::generate(SMALL.block_bytes);
        write_block(&mut disk, 5, txt.as_bytes());
        assert_eq!(read_block(&disk, 5), txt.as_bytes());

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        assert_eq!(read_block(&disk, 5), txt.as_bytes());
    }

    #[test]
    fn read_at_offset_within_block() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        let data: std::vec::Vec<u8> = (0..SMALL.block_bytes).map(|x| (x * 7) as u8).collect();
        write_block(&mut disk, 2, &data);

        let mut buf = [0u8; 64];
        assert_eq!(disk.read(&mut buf, 2, 128, 1), Ok(64));
        assert_eq!(&buf[..], &data[128..192]);
    }

    #[test]
    fn full_sector_on_blank_flash_needs_no_erase() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        let blocks_per_sector = (SMALL.sector_bytes() / SMALL.block_bytes) as u32;
        for block in 0..blocks_per_sector {
            write_block(&mut disk, block, &std::vec![0xAB; SMALL.block_bytes]);
        }
        assert_eq!(disk.storage().erase_count(), 0);
        for block in 0..blocks_per_sector {
            assert!(read_block(&disk, block).iter().all(|b| *b == 0xAB));
        }

        write_block(&mut disk, 1, &std::vec![0xCD; SMALL.block_bytes]);
        assert_eq!(disk.storage().erase_count(), 1);
        assert!(read_block(&disk, 0).iter().all(|b| *b == 0xAB));
        assert!(read_block(&disk, 1).iter().all(|b| *b == 0xCD));
    }

    #[test]
    fn out_of_range_reports_nominal_length() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        let past_end = SMALL.num_blocks() as u32;
        let mut buf = [0x5Au8; 64];
        assert_eq!(disk.read(&mut buf, past_end, 0, 1), Ok(64));
        assert_eq!(buf, [0x5A; 64]);
        assert_eq!(disk.write(&buf, past_end, 0, 1), Ok(64));
        assert_eq!(disk.storage().program_count(), 0);
    }

    #[test]
    fn password_locks_after_power_cycle() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        write_block(&mut disk, 3, &std::vec![0x42; SMALL.block_bytes]);
        set_password(&mut disk, 0, b"hunter2");

        // The set-password block itself lands on the disk and would unlock it at the next
        // open, so wipe it with ordinary data first.
        write_block(&mut disk, 0, &std::vec![0x00; SMALL.block_bytes]);
        disk.close();

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        assert!(!disk.is_unlocked());

        let mut buf = std::vec![0xEEu8; SMALL.block_bytes];
        let units = (SMALL.block_bytes / SMALL.transfer_bytes) as u32;
        assert_eq!(disk.read(&mut buf, 3, 0, units), Ok(SMALL.block_bytes));
        assert!(buf.iter().all(|b| *b == 0));

        assert!(!try_unlock(&mut disk, b"hunter3"));
        assert!(!try_unlock(&mut disk, b"Hunter2"));
        assert!(try_unlock(&mut disk, b"hunter2"));
        assert!(read_block(&disk, 3).iter().all(|b| *b == 0x42));
    }

    #[test]
    fn locked_writes_are_never_stored() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        set_password(&mut disk, 0, b"pw");
        write_block(&mut disk, 0, &std::vec![0x00; SMALL.block_bytes]);
        let programs = disk.storage().program_count();

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        assert!(!disk.is_unlocked());
        let data = std::vec![0x99u8; SMALL.transfer_bytes];
        assert_eq!(disk.write(&data, 4, 0, 1), Ok(SMALL.transfer_bytes));
        assert!(!disk.is_unlocked());
        assert_eq!(disk.storage().program_count(), programs);
    }

    #[test]
    fn stored_password_command_unlocks_at_open() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        set_password(&mut disk, 6, b"letmein");
        disk.close();

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        assert!(disk.is_unlocked());
    }

    #[test]
    fn failed_commit_faults_until_reopen() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        write_block(&mut disk, 0, &std::vec![0x11; SMALL.block_bytes]);

        let mut flash = disk.into_storage();
        flash.fail_next_erase();
        let mut disk = mount(flash, SMALL);
        disk.open(0).unwrap();

        let block = std::vec![0x22u8; SMALL.block_bytes];
        let units = (SMALL.block_bytes / SMALL.transfer_bytes) as u32;
        assert_eq!(
            disk.write(&block, 0, 0, units),
            Err(ErrorKind::StorageFault(FlashError::Erase))
        );
        assert_eq!(disk.fault(), Some(FlashError::Erase));
        assert_eq!(
            disk.write(&block, 0, 0, units),
            Err(ErrorKind::Faulted(FlashError::Erase))
        );
        assert!(read_block(&disk, 0).iter().all(|b| *b == 0x11));

        disk.open(0).unwrap();
        assert_eq!(disk.write(&block, 0, 0, units), Ok(SMALL.block_bytes));
        assert!(read_block(&disk, 0).iter().all(|b| *b == 0x22));
    }

    #[test]
    fn lost_program_fails_verify_and_faults() {
        init();
        let mut flash = RamFlash::for_geometry(&SMALL);
        flash.lose_next_program();
        let mut disk = mount(flash, SMALL);
        disk.open(0).unwrap();

        let block = std::vec![0x22u8; SMALL.block_bytes];
        let units = (SMALL.block_bytes / SMALL.transfer_bytes) as u32;
        let lost = FlashError::Verify {
            addr: SMALL.disk_base,
        };
        assert_eq!(
            disk.write(&block, 0, 0, units),
            Err(ErrorKind::StorageFault(lost))
        );
        assert_eq!(
            disk.write(&block, 1, 0, units),
            Err(ErrorKind::Faulted(lost))
        );
        assert_eq!(disk.storage().program_count(), 1);

        disk.open(0).unwrap();
        assert_eq!(disk.write(&block, 0, 0, units), Ok(SMALL.block_bytes));
        assert!(read_block(&disk, 0).iter().all(|b| *b == 0x22));
    }

    #[test]
    fn failed_password_change_faults() {
        init();
        let mut flash = RamFlash::for_geometry(&SMALL);
        flash.fail_next_program();
        let mut disk = mount(flash, SMALL);
        disk.open(0).unwrap();

        let mut data = std::vec![0u8; SMALL.transfer_bytes];
        data[..UNLOCK_TAG.len()].copy_from_slice(&UNLOCK_TAG);
        data[UNLOCK_TAG.len()..UNLOCK_TAG.len() + 4].copy_from_slice(b"pass");
        assert_eq!(
            disk.write(&data, 0, 0, 1),
            Err(ErrorKind::StorageFault(FlashError::Program))
        );
        assert_eq!(
            disk.write(&data, 0, 0, 1),
            Err(ErrorKind::Faulted(FlashError::Program))
        );

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        assert!(disk.is_unlocked());
    }

    #[test]
    fn locked_write_at_huge_offset_is_dropped() {
        init();
        let mut disk = make_disk(SMALL);
        disk.open(0).unwrap();
        set_password(&mut disk, 0, b"pw");
        write_block(&mut disk, 0, &std::vec![0x00; SMALL.block_bytes]);

        let mut disk = remount(disk);
        disk.open(0).unwrap();
        let mut data = std::vec![0u8; SMALL.transfer_bytes];
        data[..UNLOCK_TAG.len()].copy_from_slice(&UNLOCK_TAG);
        data[UNLOCK_TAG.len()..UNLOCK_TAG.len() + 2].copy_from_slice(b"pw");
        assert_eq!(
            disk.write(&data, 0, u32::MAX, 1),
            Ok(SMALL.transfer_bytes)
        );
        assert!(!disk.is_unlocked());
        assert!(try_unlock(&mut disk, b"pw"));
    }

    #[test]
    fn ioctl_reports_geometry() {
        let disk = make_disk(Geometry::F2837X);
        assert_eq!(disk.ioctl(0, GET_SECTOR_COUNT), Some(80));
        assert_eq!(disk.ioctl(0, GET_SECTOR_SIZE), Some(0x1000));
        assert_eq!(disk.ioctl(0, 0x7F), None);
        assert_eq!(disk.num_blocks(), 80);
        assert_eq!(disk.block_size(), 0x1000);
    }

    #[test]
    fn default_geometry_sector_fill() {
        init();
        let mut disk = make_disk(Geometry::F2837X);
        disk.open(0).unwrap();
        for block in 0..16 {
            write_block(&mut disk, block, &std::vec![0xAB; 0x1000]);
        }
        assert_eq!(disk.storage().erase_count(), 0);

        let mut words = std::vec![0u16; Geometry::F2837X.sector_words];
        disk.storage().read(Geometry::F2837X.disk_base, &mut words);
        assert!(words.iter().all(|w| *w == 0xABAB));
        assert!(read_block(&disk, 0).iter().all(|b| *b == 0xAB));
        assert!(read_block(&disk, 16).iter().all(|b| *b == 0xFF));
    }
}
