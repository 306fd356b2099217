//! The MMIO router (component C8): dispatches loads/stores in configured windows to
//! registered peripheral handlers, falling through to RAM otherwise.
//!
//! Grounded on the teacher's `bus.rs` (`Bus` trait: `(address, size)` read/write with
//! little-endian byte order) and `board/system_bus.rs` (`check_access`/`bus_of`
//! window-then-fallthrough dispatch pattern), simplified to a flat `Vec` of
//! caller-registered windows instead of the teacher's fixed enum of built-in resources.

use std::fmt::Debug;

/// A peripheral handler, presented with the window-relative address. Matches the
/// teacher's `Bus` trait contract: any `(address, size)` pair must be handled without
/// panicking, and values are serialized little-endian.
pub trait Bus: Debug {
    fn read(&mut self, buf: &mut [u8], address: u32);
    fn write(&mut self, address: u32, buf: &[u8]);
}

#[derive(Debug)]
struct Window {
    lo: u32,
    hi: u32,
    handler: Box<dyn Bus>,
}

/// A configuration error: two registered windows overlap.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("MMIO window [{lo:#x}, {hi:#x}) overlaps an existing window")]
pub struct OverlappingWindow {
    pub lo: u32,
    pub hi: u32,
}

#[derive(Debug, Default)]
pub struct MmioRouter {
    windows: Vec<Window>,
}

impl MmioRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `[lo, hi)`. Fails if the window overlaps one already
    /// registered.
    pub fn register(
        &mut self,
        lo: u32,
        hi: u32,
        handler: Box<dyn Bus>,
    ) -> Result<(), OverlappingWindow> {
        if self.windows.iter().any(|w| lo < w.hi && w.lo < hi) {
            return Err(OverlappingWindow { lo, hi });
        }
        self.windows.push(Window { lo, hi, handler });
        Ok(())
    }

    fn find(&mut self, address: u32, size: usize) -> Option<&mut Window> {
        let end = address as u64 + size as u64;
        self.windows
            .iter_mut()
            .find(|w| address >= w.lo && end <= w.hi as u64)
    }

    /// Returns `true` if the access was handled by a registered peripheral; `false`
    /// means the caller should fall through to RAM.
    pub fn read(&mut self, buf: &mut [u8], address: u32) -> bool {
        if let Some(window) = self.find(address, buf.len()) {
            let lo = window.lo;
            window.handler.read(buf, address - lo);
            true
        } else {
            false
        }
    }

    pub fn write(&mut self, address: u32, buf: &[u8]) -> bool {
        if let Some(window) = self.find(address, buf.len()) {
            let lo = window.lo;
            window.handler.write(address - lo, buf);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Echo {
        last_write: Option<(u32, Vec<u8>)>,
    }

    impl Bus for Echo {
        fn read(&mut self, buf: &mut [u8], _address: u32) {
            buf.fill(0xAB);
        }
        fn write(&mut self, address: u32, buf: &[u8]) {
            self.last_write = Some((address, buf.to_vec()));
        }
    }

    #[test]
    fn test_route_to_handler() {
        let mut router = MmioRouter::new();
        router.register(0x1000, 0x1010, Box::new(Echo::default())).unwrap();
        let mut buf = [0u8; 4];
        assert!(router.read(&mut buf, 0x1004));
        assert_eq!(buf, [0xAB; 4]);
    }

    #[test]
    fn test_fallthrough_outside_window() {
        let mut router = MmioRouter::new();
        router.register(0x1000, 0x1010, Box::new(Echo::default())).unwrap();
        let mut buf = [0u8; 4];
        assert!(!router.read(&mut buf, 0x2000));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut router = MmioRouter::new();
        router.register(0x1000, 0x1010, Box::new(Echo::default())).unwrap();
        let result = router.register(0x1008, 0x1020, Box::new(Echo::default()));
        assert!(result.is_err());
    }
}
