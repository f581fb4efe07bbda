//! The 64 KiB flat store and its memory-mapped I/O overlay
//!
//! The top of the address space carries a small register block for the two
//! timers and the keyboard latch.  Reads and writes of those addresses are
//! redirected into [`MmioRegs`]; everything else goes straight to the store.
//! All operations are total: no address faults, ever.

use core::mem::offset_of;
use zerocopy::{AsBytes, FromBytes, FromZeroes, LittleEndian, U16};

/// Total size of the address space
pub const RAM_SIZE: usize = 65536;

/// Maximum number of bytes [`Mem::load_program`] will copy
pub const PROGRAM_MAX: usize = 0x4000;

/// First byte of the framebuffer region
pub const FRAMEBUFFER_BASE: u16 = 0x4000;

/// Framebuffer size in bytes (128 x 128, one byte per pixel, row-major)
pub const FRAMEBUFFER_SIZE: usize = 128 * 128;

/// Framebuffer width and height in pixels
pub const SCREEN_SIZE: u16 = 128;

/// Initial stack pointer; the stack grows downward from here
pub const STACK_TOP: u16 = 0xFFEF;

/// The memory-mapped register block at [`MmioRegs::BASE`]
///
/// Byte layout is the wire layout: timers are little-endian words, so a
/// 16-bit guest read of `SYS_TIMER_LO` sees the full counter.
#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct MmioRegs {
    sys_timer: U16<LittleEndian>,
    countdown: U16<LittleEndian>,
    key_code: u8,
    key_state: u8,
}

impl MmioRegs {
    const BASE: u16 = 0xFFF0;
    const LEN: u16 = core::mem::size_of::<Self>() as u16;

    pub const SYS_TIMER_LO: u16 = Self::BASE + offset_of!(Self, sys_timer) as u16;
    pub const COUNTDOWN_LO: u16 = Self::BASE + offset_of!(Self, countdown) as u16;
    pub const COUNTDOWN_HI: u16 = Self::COUNTDOWN_LO + 1;
    pub const KEY_CODE: u16 = Self::BASE + offset_of!(Self, key_code) as u16;
    pub const KEY_STATE: u16 = Self::BASE + offset_of!(Self, key_state) as u16;
}

/// Address of the system timer overlay (read-only, little-endian)
pub const MMIO_SYS_TIMER: u16 = MmioRegs::SYS_TIMER_LO;

/// Address of the countdown timer overlay (read/write, little-endian)
pub const MMIO_COUNTDOWN: u16 = MmioRegs::COUNTDOWN_LO;

/// Address of the key-code overlay (read-only)
pub const MMIO_KEY_CODE: u16 = MmioRegs::KEY_CODE;

/// Address of the key-state overlay (read-only, 0 or 1)
pub const MMIO_KEY_STATE: u16 = MmioRegs::KEY_STATE;

/// 64 KiB store plus the MMIO overlay
///
/// Borrows the backing array for the lifetime of a run, in the same way the
/// CPU borrows `Mem` itself; the host owns the actual allocation (see
/// [`Ram`](crate::Ram)).
pub struct Mem<'a> {
    store: &'a mut [u8; RAM_SIZE],
    regs: MmioRegs,
}

impl<'a> Mem<'a> {
    /// Wraps the given backing store, zeroing the MMIO registers
    pub fn new(store: &'a mut [u8; RAM_SIZE]) -> Self {
        Self {
            store,
            regs: MmioRegs::new_zeroed(),
        }
    }

    /// Zeroes the store and the MMIO registers
    pub fn reset(&mut self) {
        self.store.fill(0);
        self.regs = MmioRegs::new_zeroed();
    }

    /// Copies a program image to address 0
    ///
    /// At most [`PROGRAM_MAX`] bytes are copied; longer images are silently
    /// truncated.
    pub fn load_program(&mut self, image: &[u8]) {
        let n = image.len().min(PROGRAM_MAX);
        self.store[..n].copy_from_slice(&image[..n]);
    }

    /// Reads one byte, honoring the MMIO overlay
    #[inline]
    pub fn read8(&self, addr: u16) -> u8 {
        if addr >= MmioRegs::BASE {
            let off = addr - MmioRegs::BASE;
            if off < MmioRegs::LEN {
                self.regs.as_bytes()[usize::from(off)]
            } else {
                // reserved band
                0
            }
        } else {
            self.store[usize::from(addr)]
        }
    }

    /// Reads a little-endian word; the address wraps modulo 2^16
    #[inline]
    pub fn read16(&self, addr: u16) -> u16 {
        let lo = self.read8(addr);
        let hi = self.read8(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    /// Writes one byte, honoring the MMIO overlay
    ///
    /// The countdown timer bytes are the only writable overlay addresses;
    /// writes to the rest of the overlay and the reserved band are dropped.
    #[inline]
    pub fn write8(&mut self, addr: u16, v: u8) {
        if addr >= MmioRegs::BASE {
            match addr {
                MmioRegs::COUNTDOWN_LO | MmioRegs::COUNTDOWN_HI => {
                    let off = usize::from(addr - MmioRegs::BASE);
                    self.regs.as_bytes_mut()[off] = v;
                }
                _ => (),
            }
        } else {
            self.store[usize::from(addr)] = v;
        }
    }

    /// Writes a little-endian word; the address wraps modulo 2^16
    #[inline]
    pub fn write16(&mut self, addr: u16, v: u16) {
        let [lo, hi] = v.to_le_bytes();
        self.write8(addr, lo);
        self.write8(addr.wrapping_add(1), hi);
    }

    /// Advances both timers by `delta_ms` milliseconds
    ///
    /// The system timer wraps at 16 bits; the countdown timer saturates at
    /// zero.
    pub fn tick_timers(&mut self, delta_ms: u16) {
        let sys = self.regs.sys_timer.get();
        self.regs.sys_timer.set(sys.wrapping_add(delta_ms));
        let cd = self.regs.countdown.get();
        self.regs.countdown.set(cd.saturating_sub(delta_ms));
    }

    /// Latches a key event
    ///
    /// A press records the code and sets the state; a release clears only
    /// the state, so the code keeps reporting the last key pressed.
    pub fn set_key(&mut self, code: u8, pressed: bool) {
        if pressed {
            self.regs.key_code = code;
            self.regs.key_state = 1;
        } else {
            self.regs.key_state = 0;
        }
    }

    /// Read-only view of the framebuffer region
    pub fn framebuffer(&self) -> &[u8] {
        &self.store[usize::from(FRAMEBUFFER_BASE)..][..FRAMEBUFFER_SIZE]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        mem.write16(0x8000, 0xABCD);
        assert_eq!(mem.read8(0x8000), 0xCD);
        assert_eq!(mem.read8(0x8001), 0xAB);
        assert_eq!(
            mem.read16(0x8000),
            u16::from(mem.read8(0x8000)) | (u16::from(mem.read8(0x8001)) << 8)
        );
    }

    #[test]
    fn address_arithmetic_wraps() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        mem.write8(0x0000, 0x12);
        // high byte of a word at 0xFFFF lands at 0x0000; the low byte is
        // in the reserved band and reads back as zero
        assert_eq!(mem.read16(0xFFFF), 0x1200);
    }

    #[test]
    fn read_only_overlay_ignores_writes() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        mem.tick_timers(0x1234);
        mem.write8(MMIO_SYS_TIMER, 0xFF);
        mem.write8(MMIO_SYS_TIMER + 1, 0xFF);
        assert_eq!(mem.read16(MMIO_SYS_TIMER), 0x1234);

        mem.set_key(0x41, true);
        mem.write8(MMIO_KEY_CODE, 0);
        mem.write8(MMIO_KEY_STATE, 0);
        assert_eq!(mem.read8(MMIO_KEY_CODE), 0x41);
        assert_eq!(mem.read8(MMIO_KEY_STATE), 1);

        // reserved band: writes dropped, reads are zero
        mem.write8(0xFFF6, 0xAA);
        assert_eq!(mem.read8(0xFFF6), 0);
        mem.write8(0xFFFF, 0xAA);
        assert_eq!(mem.read8(0xFFFF), 0);
    }

    #[test]
    fn countdown_is_guest_writable() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        mem.write16(MMIO_COUNTDOWN, 100);
        assert_eq!(mem.read16(MMIO_COUNTDOWN), 100);
        mem.tick_timers(50);
        assert_eq!(mem.read16(MMIO_SYS_TIMER), 50);
        assert_eq!(mem.read16(MMIO_COUNTDOWN), 50);
        mem.tick_timers(60);
        assert_eq!(mem.read16(MMIO_SYS_TIMER), 110);
        assert_eq!(mem.read16(MMIO_COUNTDOWN), 0);
    }

    #[test]
    fn key_latch_keeps_last_code() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        mem.set_key(0x41, true);
        mem.set_key(0x00, false);
        assert_eq!(mem.read8(MMIO_KEY_CODE), 0x41);
        assert_eq!(mem.read8(MMIO_KEY_STATE), 0);
        mem.set_key(0x42, true);
        assert_eq!(mem.read8(MMIO_KEY_CODE), 0x42);
        assert_eq!(mem.read8(MMIO_KEY_STATE), 1);
    }

    #[test]
    fn program_load_truncates() {
        let mut store = [0u8; RAM_SIZE];
        let mut mem = Mem::new(&mut store);
        let image = [0xABu8; PROGRAM_MAX + 100];
        mem.load_program(&image);
        assert_eq!(mem.read8(0x3FFF), 0xAB);
        // first framebuffer byte must be untouched
        assert_eq!(mem.read8(0x4000), 0);
    }
}
