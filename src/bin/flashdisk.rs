use flashdisk::ram::RamFlash;
use flashdisk::{FlashDisk, Geometry, MAX_SECRET_LEN, UNLOCK_TAG};
use log::{info, warn, LevelFilter};
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "flashdisk", about = "Drive a simulated password-gated flash disk image.")]
struct Opt {
    /// Flash image file.
    #[structopt(short, long, parse(from_os_str), default_value = "flashdisk.img")]
    image: PathBuf,

    /// Unlock attempt sent right after the drive opens.
    #[structopt(short, long)]
    password: Option<String>,

    /// Log verbosity, repeat for more.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Create a blank image.
    Format,
    /// Show geometry and lock state.
    Info,
    /// Write a password command block, replacing the stored password.
    SetPassword {
        secret: String,
        /// Block that receives the command. Defaults to the last block of the disk.
        #[structopt(long)]
        block: Option<u32>,
    },
    /// Write a file to the disk starting at `block`.
    Write {
        block: u32,
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },
    /// Read `count` blocks starting at `block`.
    Read {
        block: u32,
        #[structopt(default_value = "1")]
        count: u32,
        /// Write raw bytes here instead of a hex dump on stdout.
        #[structopt(short, long, parse(from_os_str))]
        output: Option<PathBuf>,
    },
}

type Disk<'c> = FlashDisk<'c, RamFlash>;

fn write_blocks(disk: &mut Disk<'_>, block: u32, data: &[u8]) -> Result<(), Box<dyn Error>> {
    let geometry = *disk.geometry();
    let transfer = geometry.transfer_bytes;
    for (i, chunk) in data.chunks(geometry.block_bytes).enumerate() {
        let mut buf = vec![0u8; geometry.block_bytes];
        buf[..chunk.len()].copy_from_slice(chunk);
        for (j, piece) in buf.chunks(transfer).enumerate() {
            disk.write(piece, block + i as u32, (j * transfer) as u32, 1)?;
        }
    }
    Ok(())
}

fn try_unlock(disk: &mut Disk<'_>, secret: &str) -> Result<bool, Box<dyn Error>> {
    let geometry = *disk.geometry();
    let mut buf = vec![0u8; geometry.transfer_bytes];
    let secret = secret.as_bytes();
    let len = secret
        .len()
        .min(MAX_SECRET_LEN)
        .min(buf.len() - UNLOCK_TAG.len());
    buf[..UNLOCK_TAG.len()].copy_from_slice(&UNLOCK_TAG);
    buf[UNLOCK_TAG.len()..UNLOCK_TAG.len() + len].copy_from_slice(&secret[..len]);
    let offset = (geometry.block_bytes - geometry.transfer_bytes) as u32;
    disk.write(&buf, 0, offset, 1)?;
    Ok(disk.is_unlocked())
}

fn hex_dump(start: usize, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:08x}: {}", start + i * 16, hex.join(" "));
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn Error>> {
    let geometry = Geometry::default();
    let flash = match opt.cmd {
        Command::Format => RamFlash::for_geometry(&geometry),
        _ => RamFlash::from_image(&std::fs::read(&opt.image)?, &geometry)?,
    };

    let mut cache = vec![0u16; geometry.sector_words];
    let mut disk = FlashDisk::new(flash, geometry, &mut cache)?;
    disk.open(0)?;

    if let Some(password) = &opt.password {
        if !disk.is_unlocked() && !try_unlock(&mut disk, password)? {
            warn!("password rejected");
        }
    }

    let mut dirty = false;
    match opt.cmd {
        Command::Format => {
            info!("formatted {}", opt.image.display());
            dirty = true;
        }
        Command::Info => {
            println!("blocks:     {}", disk.num_blocks());
            println!("block size: {}", disk.block_size());
            println!("status:     {:?}", disk.status());
            println!(
                "lock:       {}",
                if disk.is_unlocked() { "unlocked" } else { "locked" }
            );
        }
        Command::SetPassword { secret, block } => {
            if !disk.is_unlocked() {
                return Err("drive is locked, password unchanged".into());
            }
            let block = block.unwrap_or(disk.num_blocks() - 1);
            let mut data = UNLOCK_TAG.to_vec();
            data.extend_from_slice(secret.as_bytes());
            write_blocks(&mut disk, block, &data)?;
            warn!(
                "block {} now holds the password command and unlocks the drive on open",
                block
            );
            dirty = true;
        }
        Command::Write { block, input } => {
            if !disk.is_unlocked() {
                return Err("drive is locked, write discarded".into());
            }
            let data = std::fs::read(&input)?;
            write_blocks(&mut disk, block, &data)?;
            info!("wrote {} bytes at block {}", data.len(), block);
            dirty = true;
        }
        Command::Read {
            block,
            count,
            output,
        } => {
            let geometry = *disk.geometry();
            let units = (geometry.block_bytes / geometry.transfer_bytes) as u32;
            let mut data = vec![0u8; count as usize * geometry.block_bytes];
            for (i, buf) in data.chunks_mut(geometry.block_bytes).enumerate() {
                disk.read(buf, block + i as u32, 0, units)?;
            }
            match output {
                Some(path) => std::fs::File::create(path)?.write_all(&data)?,
                None => hex_dump(block as usize * geometry.block_bytes, &data),
            }
        }
    }

    disk.close();
    if dirty {
        std::fs::write(&opt.image, disk.into_storage().to_image())?;
    }
    Ok(())
}

fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(level)
        .init();

    if let Err(err) = run(opt) {
        eprintln!("flashdisk: {}", err);
        std::process::exit(1);
    }
}
