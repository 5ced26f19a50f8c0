use crate::password::{PasswordRecord, RECORD_WORDS};
use crate::storage::{erase_sector, program_verified, FlashError, Geometry, Storage, WordAddr};
use crate::util::{MARKER_WORDS, UNLOCK_TAG};
use log::{debug, info};

const SCAN_CHUNK_WORDS: usize = 256;

/// Words after the marker that can hold a packed secret plus its NUL.
const PACKED_SECRET_WORDS: usize = RECORD_WORDS / 2;

/// An unlock attempt, as it arrives from the host or as found on flash.
pub(crate) enum Candidate<'a> {
    /// Host write buffer: [`UNLOCK_TAG`] followed by the secret as a C-string.
    Host(&'a [u8]),
    /// Flash words starting at the marker, secret packed two bytes per word.
    Flash(&'a [u16]),
}

/// Lock state of the drive and the persisted password behind it.
pub(crate) struct AccessGate {
    unlocked: bool,
}

impl AccessGate {
    pub(crate) fn new() -> Self {
        AccessGate { unlocked: false }
    }

    pub(crate) fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Derive the lock state from flash contents. Only run when the drive opens.
    pub(crate) fn initialize<T: Storage>(&mut self, storage: &T, geometry: &Geometry) {
        self.unlocked = match find_marker(storage, geometry) {
            Some(addr) => {
                debug!("unlock marker at 0x{:x}", addr.0);
                let disk_end = geometry.disk_base.offset(geometry.disk_words());
                let num_words = core::cmp::min(
                    MARKER_WORDS.len() + PACKED_SECRET_WORDS,
                    disk_end.0 - addr.0,
                );
                let mut words = [0u16; MARKER_WORDS.len() + PACKED_SECRET_WORDS];
                storage.read(addr, &mut words[..num_words]);
                self.verify(storage, geometry, Candidate::Flash(&words[..num_words]))
            }
            None => PasswordRecord::load(storage, geometry.password_base).is_empty(),
        };
        info!(
            "drive {}",
            if self.unlocked { "unlocked" } else { "locked" }
        );
    }

    pub(crate) fn verify<T: Storage>(
        &self,
        storage: &T,
        geometry: &Geometry,
        candidate: Candidate<'_>,
    ) -> bool {
        let record = PasswordRecord::load(storage, geometry.password_base);
        if record.is_empty() {
            return true;
        }
        match candidate {
            Candidate::Host(bytes) => match bytes.strip_prefix(&UNLOCK_TAG[..]) {
                Some(secret) => record.matches_command(secret),
                None => false,
            },
            Candidate::Flash(words) => match words.strip_prefix(&MARKER_WORDS[..]) {
                Some(packed) => record.matches_packed(packed),
                None => false,
            },
        }
    }

    /// Replace the lock state with the outcome of a host unlock attempt.
    pub(crate) fn attempt_unlock<T: Storage>(
        &mut self,
        storage: &T,
        geometry: &Geometry,
        candidate: &[u8],
    ) -> bool {
        self.unlocked = self.verify(storage, geometry, Candidate::Host(candidate));
        info!("unlock attempt {}", if self.unlocked { "accepted" } else { "rejected" });
        self.unlocked
    }

    /// Persist a new secret, erasing the old record first when the slot is not blank.
    pub(crate) fn set_password<T: Storage>(
        &mut self,
        storage: &mut T,
        geometry: &Geometry,
        secret: &[u8],
    ) -> Result<(), FlashError> {
        let record = PasswordRecord::from_secret(secret);
        let current = PasswordRecord::load(storage, geometry.password_base);
        if !current.is_blank() {
            debug!("erase password sector at 0x{:x}", geometry.password_base.0);
            erase_sector(
                storage,
                geometry.password_base,
                geometry.password_sector_words,
            )?;
        }
        program_verified(
            storage,
            geometry.password_base,
            record.words(),
            geometry.program_chunk_words,
        )?;
        info!("password set, length: {}", record.secret_len());
        Ok(())
    }
}

/// First word-aligned occurrence of the unlock marker on the disk.
fn find_marker<T: Storage>(storage: &T, geometry: &Geometry) -> Option<WordAddr> {
    let total = geometry.disk_words();
    let overlap = MARKER_WORDS.len() - 1;
    let mut buf = [0u16; SCAN_CHUNK_WORDS];
    let mut pos = 0;
    while pos + MARKER_WORDS.len() <= total {
        let num_words = core::cmp::min(SCAN_CHUNK_WORDS, total - pos);
        storage.read(geometry.disk_base.offset(pos), &mut buf[..num_words]);
        if let Some(idx) = buf[..num_words]
            .windows(MARKER_WORDS.len())
            .position(|w| w == MARKER_WORDS)
        {
            return Some(geometry.disk_base.offset(pos + idx));
        }
        if pos + num_words == total {
            break;
        }
        pos += num_words - overlap;
    }
    None
}
