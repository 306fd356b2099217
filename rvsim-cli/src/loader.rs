//! ELF/flat-binary image loading (component E2).
//!
//! Grounded on `load_elf` in the teacher's `red-planet-cli/src/main.rs` (`PT_LOAD`
//! segment iteration via `goblin`, loaded straight into physical memory) and the
//! `tohost`/signature symbol lookups in `red-planet-test/src/main.rs`.

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::debug;
use rvsim_core::Engine;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Elf(#[from] goblin::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("segment at {address:#010x} (size {size}) doesn't fit in guest RAM")]
    OutOfBounds { address: u32, size: usize },
    #[error("image is missing required symbol `{name}`")]
    MissingSymbol { name: &'static str },
}

/// ELF metadata the CLI and test harness need beyond raw bytes: the entry point and,
/// if present, the `tohost`/signature symbols the compliance suites rely on.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub entry: u32,
    pub tohost: Option<u32>,
    pub begin_signature: Option<u32>,
    pub end_signature: Option<u32>,
}

impl ImageInfo {
    pub fn require_tohost(&self) -> Result<u32, LoadError> {
        self.tohost.ok_or(LoadError::MissingSymbol { name: "tohost" })
    }

    pub fn require_begin_signature(&self) -> Result<u32, LoadError> {
        self.begin_signature.ok_or(LoadError::MissingSymbol {
            name: "begin_signature",
        })
    }

    pub fn require_end_signature(&self) -> Result<u32, LoadError> {
        self.end_signature.ok_or(LoadError::MissingSymbol {
            name: "end_signature",
        })
    }
}

/// Loads an ELF image's `PT_LOAD` segments into `engine`'s memory.
pub fn load_elf(engine: &mut Engine, bytes: &[u8]) -> Result<ImageInfo, LoadError> {
    let elf = Elf::parse(bytes)?;

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        debug!(
            "loading segment: file [{:#x}..{:#x}] -> guest [{:#x}..{:#x}]",
            header.p_offset,
            header.p_offset + header.p_filesz,
            header.p_paddr,
            header.p_paddr + header.p_memsz,
        );
        let data = &bytes[header.file_range()];
        engine
            .memory_mut()
            .store_bytes(header.p_paddr as u32, data)
            .map_err(|_| LoadError::OutOfBounds {
                address: header.p_paddr as u32,
                size: data.len(),
            })?;
    }

    let symbol = |name: &str| {
        elf.syms
            .iter()
            .find(|sym| elf.strtab.get_at(sym.st_name) == Some(name))
            .map(|sym| sym.st_value as u32)
    };

    Ok(ImageInfo {
        entry: elf.entry as u32,
        tohost: symbol("tohost"),
        begin_signature: symbol("begin_signature"),
        end_signature: symbol("end_signature"),
    })
}

/// Loads a flat binary at a fixed physical address (no ELF metadata available).
pub fn load_flat(engine: &mut Engine, address: u32, bytes: &[u8]) -> Result<(), LoadError> {
    engine
        .memory_mut()
        .store_bytes(address, bytes)
        .map_err(|_| LoadError::OutOfBounds {
            address,
            size: bytes.len(),
        })
}
