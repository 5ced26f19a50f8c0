use crate::ram::RamFlash;
use crate::storage::{Geometry, WordAddr};
use crate::FlashDisk;

/// Four sectors of four blocks each, followed by a small password sector.
pub(crate) const SMALL: Geometry = Geometry {
    disk_base: WordAddr(0x1000),
    disk_bytes: 0x2000,
    sector_words: 0x400,
    block_bytes: 0x200,
    transfer_bytes: 64,
    program_chunk_words: 8,
    password_base: WordAddr(0x2000),
    password_sector_words: 0x100,
};

pub(crate) fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn leak_cache(geometry: &Geometry) -> &'static mut [u16] {
    std::boxed::Box::leak(std::vec![0u16; geometry.sector_words].into_boxed_slice())
}

pub(crate) fn mount(flash: RamFlash, geometry: Geometry) -> FlashDisk<'static, RamFlash> {
    FlashDisk::new(flash, geometry, leak_cache(&geometry)).unwrap()
}

pub(crate) fn make_disk(geometry: Geometry) -> FlashDisk<'static, RamFlash> {
    mount(RamFlash::for_geometry(&geometry), geometry)
}

/// Simulate a power cycle: same flash, fresh RAM state.
pub(crate) fn remount(disk: FlashDisk<'static, RamFlash>) -> FlashDisk<'static, RamFlash> {
    let geometry = *disk.geometry();
    mount(disk.into_storage(), geometry)
}

/// Write one block the way the mass storage front end does, one transfer at a time.
pub(crate) fn write_block(disk: &mut FlashDisk<'static, RamFlash>, block: u32, data: &[u8]) {
    let transfer = disk.geometry().transfer_bytes;
    assert_eq!(data.len(), disk.geometry().block_bytes);
    for (i, piece) in data.chunks(transfer).enumerate() {
        let written = disk.write(piece, block, (i * transfer) as u32, 1).unwrap();
        assert_eq!(written, transfer);
    }
}

pub(crate) fn read_block(disk: &FlashDisk<'static, RamFlash>, block: u32) -> std::vec::Vec<u8> {
    let geometry = disk.geometry();
    let mut data = std::vec![0u8; geometry.block_bytes];
    let units = (geometry.block_bytes / geometry.transfer_bytes) as u32;
    disk.read(&mut data, block, 0, units).unwrap();
    data
}
