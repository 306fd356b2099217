mod blockdev;
mod gdb;
mod loader;
mod uart;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};
use rvsim_core::{Config, Engine, StepResult};

use blockdev::{BlockDevice, FileBacking};
use uart::Uart;

const UART_BASE: u32 = 0x1000_0000;
const UART_SIZE: u32 = 0x8;
const BLOCKDEV_BASE: u32 = 0x1001_0000;
const BLOCKDEV_SIZE: u32 = 0x8 + 512;

/// A user-space instruction-set simulator for 32-bit RISC-V (RV32IMAC, M-mode only).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Binary image to run.
    image: PathBuf,

    /// Treat `image` as a flat binary loaded at `--load-address` instead of an ELF.
    #[arg(long)]
    flat: bool,

    /// Physical address to load a flat binary at.
    #[arg(long, default_value_t = 0x8000_0000)]
    load_address: u32,

    /// PC to start execution at; defaults to the ELF entry point (or `--load-address`
    /// for a flat binary).
    #[arg(long)]
    entry: Option<u32>,

    /// Dump the `begin_signature..end_signature` memory range to this file on exit.
    #[arg(long)]
    signature: Option<PathBuf>,

    /// Start a GDB remote-serial-protocol server on this port instead of free-running.
    #[arg(long)]
    gdb_port: Option<u16>,

    /// Guest RAM size, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    ram_size: u32,

    /// Disable the "C" (compressed instruction) extension.
    #[arg(long)]
    no_misa_c: bool,

    /// Backing file for the block device peripheral.
    #[arg(long)]
    block_device: Option<PathBuf>,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut engine = Engine::new(Config {
        reset_vector: args.load_address,
        ram_size: args.ram_size,
        misa_c: !args.no_misa_c,
    });

    engine
        .mmio_mut()
        .register(UART_BASE, UART_BASE + UART_SIZE, Box::new(Uart::new()))
        .expect("UART window does not overlap");

    if let Some(path) = &args.block_device {
        let backing = FileBacking::open(path)?;
        engine
            .mmio_mut()
            .register(
                BLOCKDEV_BASE,
                BLOCKDEV_BASE + BLOCKDEV_SIZE,
                Box::new(BlockDevice::new(backing)),
            )
            .expect("block device window does not overlap");
    }

    let mut buf = Vec::new();
    File::open(&args.image)?.read_to_end(&mut buf)?;

    let image = if args.flat {
        loader::load_flat(&mut engine, args.load_address, &buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        loader::ImageInfo {
            entry: args.load_address,
            ..Default::default()
        }
    } else {
        loader::load_elf(&mut engine, &buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    };

    engine.set_pc(args.entry.unwrap_or(image.entry));

    if let Some(port) = args.gdb_port {
        return gdb::serve(port, engine);
    }

    loop {
        match engine.step() {
            StepResult::Continue => {}
            StepResult::Terminated(code) => {
                info!("guest exited with code {code}");
                break;
            }
            StepResult::HostError(err) => {
                warn!(
                    "host error: unhandled synchronous trap (cause {}) at pc {:#010x}",
                    err.cause, err.pc
                );
                break;
            }
        }
    }

    if let Some(path) = args.signature {
        dump_signature(&mut engine, &image, &path)?;
    }

    Ok(())
}

fn dump_signature(
    engine: &mut Engine,
    image: &loader::ImageInfo,
    path: &PathBuf,
) -> std::io::Result<()> {
    let start = image
        .require_begin_signature()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let end = image
        .require_end_signature()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = File::create(path)?;
    for address in (start..end).step_by(4) {
        let word = engine
            .mem_load_u32(address)
            .expect("guest memory error while reading signature");
        writeln!(file, "{word:08x}")?;
    }
    Ok(())
}
