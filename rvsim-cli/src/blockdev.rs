//! A file-backed block device (component E5): not exercised by the CPU-only
//! compliance suites, but present as part of the ambient peripheral stack named in
//! §1's external-collaborator list.
//!
//! No direct teacher precedent -- the teacher workspace has no block device -- so
//! this is grounded on the same `Bus`-handler shape as `uart.rs` and on the
//! register-window conventions (`Bus::read`/`write` over a small fixed offset map)
//! seen throughout `red-planet-core/src/resources`.

use std::io::{Read, Seek, SeekFrom, Write};

use rvsim_core::mmio::Bus;

const SECTOR_SIZE: usize = 512;
const REG_SECTOR: u32 = 0x000;
const REG_COMMAND: u32 = 0x004;
const REG_DATA: u32 = 0x008;
const REG_DATA_END: u32 = REG_DATA + SECTOR_SIZE as u32;

const CMD_READ: u32 = 1;
const CMD_WRITE: u32 = 2;

pub trait Backing: std::fmt::Debug {
    fn read_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// A backing store in a host file, one `SECTOR_SIZE`-byte sector per slot.
#[derive(Debug)]
pub struct FileBacking {
    file: std::fs::File,
}

impl FileBacking {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl Backing for FileBacking {
    fn read_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let offset = sector as u64 * SECTOR_SIZE as u64;
        if self.file.seek(SeekFrom::Start(offset)).is_ok() {
            let _ = self.file.read_exact(buf);
        }
    }

    fn write_sector(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let offset = sector as u64 * SECTOR_SIZE as u64;
        if self.file.seek(SeekFrom::Start(offset)).is_ok() {
            let _ = self.file.write_all(buf);
        }
    }
}

/// An in-memory backing store, for tests.
#[derive(Debug, Default)]
pub struct MemBacking {
    sectors: std::collections::HashMap<u32, [u8; SECTOR_SIZE]>,
}

impl Backing for MemBacking {
    fn read_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        *buf = *self.sectors.get(&sector).unwrap_or(&[0; SECTOR_SIZE]);
    }

    fn write_sector(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.sectors.insert(sector, *buf);
    }
}

/// A sector number register, a command register (`1` = read sector into the data
/// window, `2` = write sector from it), and a 512-byte data window.
#[derive(Debug)]
pub struct BlockDevice<B: Backing> {
    backing: B,
    sector: u32,
    data: [u8; SECTOR_SIZE],
}

impl<B: Backing> BlockDevice<B> {
    pub fn new(backing: B) -> Self {
        Self {
            backing,
            sector: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

impl<B: Backing> Bus for BlockDevice<B> {
    fn read(&mut self, buf: &mut [u8], address: u32) {
        match address {
            REG_SECTOR if buf.len() == 4 => buf.copy_from_slice(&self.sector.to_le_bytes()),
            REG_COMMAND => buf.fill(0),
            a if (REG_DATA..REG_DATA_END).contains(&a) => {
                let offset = (a - REG_DATA) as usize;
                let end = (offset + buf.len()).min(SECTOR_SIZE);
                buf[..end - offset].copy_from_slice(&self.data[offset..end]);
            }
            _ => buf.fill(0),
        }
    }

    fn write(&mut self, address: u32, buf: &[u8]) {
        match address {
            REG_SECTOR if buf.len() == 4 => {
                self.sector = u32::from_le_bytes(buf.try_into().unwrap());
            }
            REG_COMMAND if buf.len() == 4 => {
                match u32::from_le_bytes(buf.try_into().unwrap()) {
                    CMD_READ => self.backing.read_sector(self.sector, &mut self.data),
                    CMD_WRITE => self.backing.write_sector(self.sector, &self.data),
                    _ => {}
                }
            }
            a if (REG_DATA..REG_DATA_END).contains(&a) => {
                let offset = (a - REG_DATA) as usize;
                let end = (offset + buf.len()).min(SECTOR_SIZE);
                self.data[offset..end].copy_from_slice(&buf[..end - offset]);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_sector_round_trip() {
        let mut dev = BlockDevice::new(MemBacking::default());
        dev.write(REG_DATA, &[0xAB; 16]);
        dev.write(REG_SECTOR, &3u32.to_le_bytes());
        dev.write(REG_COMMAND, &CMD_WRITE.to_le_bytes());

        let mut fresh = BlockDevice::new(MemBacking::default());
        std::mem::swap(&mut fresh.backing, &mut dev.backing);
        fresh.write(REG_SECTOR, &3u32.to_le_bytes());
        fresh.write(REG_COMMAND, &CMD_READ.to_le_bytes());
        let mut out = [0u8; 16];
        fresh.read(&mut out, REG_DATA);
        assert_eq!(out, [0xAB; 16]);
    }
}
