//! Paged memory bus with I/O routing and open-bus semantics
//!
//! The address space is split into fixed, power-of-two sized pages. Each page
//! is either routed to the I/O devices (when `(addr & io_mask) == io_eq`) or
//! backed by a slice of a [`MemoryBlock`]. Accesses that hit neither leave the
//! open-bus latch alone, which is how real hardware behaves when nothing
//! drives the data lines.
//!
//! Regions are mapped once at system construction time (and re-mapped on bank
//! switches). There is no unmap.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::cpu::InterruptKind;

/// Errors raised by [`SystemBus::map`]. Reads and writes never fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("address {addr:#x} is not aligned to the {page_size}-byte page size")]
    Unaligned { addr: u32, page_size: u32 },
    #[error("length {len:#x} is not a multiple of the {page_size}-byte page size")]
    BadLength { len: u32, page_size: u32 },
    #[error("region {addr:#x}+{len:#x} is outside the address space")]
    OutOfRange { addr: u32, len: u32 },
    #[error("backing block of {block_len} bytes cannot supply {len} bytes at offset {offset}")]
    BackingTooShort { block_len: usize, offset: usize, len: u32 },
}

/// Shared byte storage that pages point into.
///
/// Cloning is cheap and aliases the same bytes, so one block can be mapped at
/// several addresses (RAM mirrors) and inspected from a debugger while the
/// emulation thread is parked.
#[derive(Clone)]
pub struct MemoryBlock {
    bytes: Arc<[AtomicU8]>,
}

impl MemoryBlock {
    /// Allocate a zero-filled block
    pub fn new(len: usize) -> Self {
        MemoryBlock {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Allocate a block holding a copy of `data`
    pub fn from_bytes(data: &[u8]) -> Self {
        MemoryBlock {
            bytes: data.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn read(&self, index: usize) -> u8 {
        self.bytes[index].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn write(&self, index: usize, value: u8) {
        self.bytes[index].store(value, Ordering::Relaxed);
    }

    /// Copy `data` into the block starting at `offset`
    pub fn load(&self, offset: usize, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.write(offset + i, b);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// True if both handles refer to the same storage
    pub fn same_storage(&self, other: &MemoryBlock) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock").field("len", &self.len()).finish()
    }
}

/// Where a memory-backed page gets its bytes from
#[derive(Clone, Debug)]
struct PageBacking {
    block: MemoryBlock,
    offset: usize,
}

/// One page of the address space
#[derive(Clone, Debug)]
pub struct Page {
    backing: Option<PageBacking>,
    pub flags: u32,
    pub io_mask: u32,
    pub io_eq: u32,
    pub cycles_per_access: u32,
}

impl Page {
    /// Writes are dropped
    pub const READ_ONLY: u32 = 1;
    /// The JIT holds compiled code for this page
    pub const HAS_CODE: u32 = 2;

    /// `io_mask`/`io_eq` pair that never matches
    const NEVER_IO: (u32, u32) = (0, 1);

    /// A page that is never routed to I/O
    pub fn memory(cycles_per_access: u32) -> Self {
        Page {
            backing: None,
            flags: 0,
            io_mask: Self::NEVER_IO.0,
            io_eq: Self::NEVER_IO.1,
            cycles_per_access,
        }
    }

    /// A page where every address is routed to I/O
    pub fn io(cycles_per_access: u32) -> Self {
        Self::io_partial(0, 0, cycles_per_access)
    }

    /// A page where only addresses with `(addr & io_mask) == io_eq` are I/O
    pub fn io_partial(io_mask: u32, io_eq: u32, cycles_per_access: u32) -> Self {
        Page {
            backing: None,
            flags: 0,
            io_mask,
            io_eq,
            cycles_per_access,
        }
    }

    #[inline(always)]
    pub fn is_io(&self, addr: u32) -> bool {
        (addr & self.io_mask) == self.io_eq
    }

    /// Can any address of this page reach the I/O devices?
    pub fn routes_io(&self) -> bool {
        (self.io_mask, self.io_eq) != Self::NEVER_IO
    }

    pub fn is_mapped(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & Self::READ_ONLY != 0
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::memory(1)
    }
}

/// Page table
pub struct MemoryMap {
    pub page_size: u32,
    pub page_shift: u32,
    pub page_mask: u32,
    pages: Vec<Page>,
    /// Indices of code pages that were written or remapped since the JIT
    /// last looked
    dirty_code: Vec<u32>,
}

impl MemoryMap {
    pub fn new(page_shift: u32, pages: Vec<Page>) -> Self {
        let page_size = 1u32 << page_shift;
        MemoryMap {
            page_size,
            page_shift,
            page_mask: page_size - 1,
            pages,
            dirty_code: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn page_index(&self, addr: u32) -> usize {
        (addr >> self.page_shift) as usize
    }

    #[inline(always)]
    pub fn page(&self, addr: u32) -> &Page {
        &self.pages[self.page_index(addr)]
    }

    pub fn page_mut(&mut self, addr: u32) -> &mut Page {
        let idx = self.page_index(addr);
        &mut self.pages[idx]
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Read the backing store, ignoring I/O routing. `None` for unmapped pages.
    #[inline]
    pub fn read(&self, addr: u32) -> Option<u8> {
        let page = self.page(addr);
        page.backing
            .as_ref()
            .map(|b| b.block.read(b.offset + (addr & self.page_mask) as usize))
    }

    /// Write the backing store, ignoring I/O routing. Returns false if the
    /// write was dropped (unmapped or read-only).
    #[inline]
    pub fn write(&mut self, addr: u32, value: u8) -> bool {
        let idx = self.page_index(addr);
        let page_mask = self.page_mask;
        let page = &self.pages[idx];
        if page.flags & Page::READ_ONLY != 0 {
            return false;
        }
        let Some(backing) = page.backing.as_ref() else {
            return false;
        };
        backing.block.write(backing.offset + (addr & page_mask) as usize, value);
        if page.flags & Page::HAS_CODE != 0 {
            self.dirty_aliases(idx);
        }
        true
    }

    /// Queue `idx` and every page sharing its backing bytes as stale code
    fn dirty_aliases(&mut self, idx: usize) {
        let Some(target) = self.pages[idx].backing.clone() else {
            return;
        };
        for (i, page) in self.pages.iter_mut().enumerate() {
            if page.flags & Page::HAS_CODE == 0 {
                continue;
            }
            if let Some(b) = &page.backing {
                if b.offset == target.offset && b.block.same_storage(&target.block) {
                    page.flags &= !Page::HAS_CODE;
                    self.dirty_code.push(i as u32);
                }
            }
        }
    }

    /// Install `block[offset..offset + len]` at `addr`.
    ///
    /// The read-only flag of every covered page is replaced with `read_only`.
    pub fn map(
        &mut self,
        addr: u32,
        block: &MemoryBlock,
        offset: usize,
        len: u32,
        read_only: bool,
    ) -> Result<(), BusError> {
        if addr & self.page_mask != 0 {
            return Err(BusError::Unaligned { addr, page_size: self.page_size });
        }
        if len % self.page_size != 0 {
            warn!(addr, len, page_size = self.page_size, "map length is not a page multiple");
            return Err(BusError::BadLength { len, page_size: self.page_size });
        }
        let first = self.page_index(addr);
        let count = (len / self.page_size) as usize;
        if first + count > self.pages.len() {
            return Err(BusError::OutOfRange { addr, len });
        }
        if offset + len as usize > block.len() {
            return Err(BusError::BackingTooShort { block_len: block.len(), offset, len });
        }

        for i in 0..count {
            let idx = first + i;
            let page = &mut self.pages[idx];
            page.backing = Some(PageBacking {
                block: block.clone(),
                offset: offset + i * self.page_size as usize,
            });
            if read_only {
                page.flags |= Page::READ_ONLY;
            } else {
                page.flags &= !Page::READ_ONLY;
            }
            if page.flags & Page::HAS_CODE != 0 {
                page.flags &= !Page::HAS_CODE;
                self.dirty_code.push(idx as u32);
            }
        }
        Ok(())
    }

    /// Flag every page that shares backing bytes with the page at `addr` as
    /// holding compiled code, so a write through any mirror is noticed.
    pub fn mark_code(&mut self, addr: u32) {
        let idx = self.page_index(addr);
        let Some(target) = self.pages[idx].backing.clone() else {
            self.pages[idx].flags |= Page::HAS_CODE;
            return;
        };
        for page in self.pages.iter_mut() {
            if let Some(b) = &page.backing {
                if b.offset == target.offset && b.block.same_storage(&target.block) {
                    page.flags |= Page::HAS_CODE;
                }
            }
        }
    }

    /// Page indices whose compiled code is stale, in the order they went stale
    pub fn take_dirty_code(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dirty_code)
    }

    pub fn has_dirty_code(&self) -> bool {
        !self.dirty_code.is_empty()
    }
}

/// Devices sitting behind I/O-routed pages.
///
/// Each method receives the page table so a device (e.g. a cartridge mapper)
/// can fall through to plain memory or switch banks without re-entering the
/// bus.
pub trait IoDevices: Send {
    /// Whether `addr` has a device behind it. Only consulted by
    /// [`SystemBus::query_io`].
    fn is_io_device_address(&self, _addr: u32) -> bool {
        true
    }

    /// `data` holds the current open-bus value; leave it alone to model a
    /// floating bus.
    fn read(&mut self, addr: u32, data: &mut u8, memory: &mut MemoryMap);

    fn write(&mut self, addr: u32, value: u8, memory: &mut MemoryMap);

    /// The CPU took an interrupt; deassert or acknowledge the line
    fn irq_taken(&mut self, _kind: InterruptKind) {}
}

/// No devices at all. Reads float, writes vanish.
pub struct NoIo;

impl IoDevices for NoIo {
    fn is_io_device_address(&self, _addr: u32) -> bool {
        false
    }

    fn read(&mut self, _addr: u32, _data: &mut u8, _memory: &mut MemoryMap) {}

    fn write(&mut self, _addr: u32, _value: u8, _memory: &mut MemoryMap) {}
}

/// The CPU-facing bus
pub struct SystemBus {
    pub memory: MemoryMap,
    io: Box<dyn IoDevices>,
    mem_mask: u32,
    open_bus: u8,
    /// When false the low address byte is left on the bus instead of the data
    pub open_bus_is_data: bool,
}

impl SystemBus {
    pub fn new(page_shift: u32, addr_bus_bits: u32, pages: Vec<Page>, io: Box<dyn IoDevices>) -> Self {
        let mem_mask = if addr_bus_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << addr_bus_bits) - 1
        };
        SystemBus {
            memory: MemoryMap::new(page_shift, pages),
            io,
            mem_mask,
            open_bus: 0,
            open_bus_is_data: true,
        }
    }

    /// Bus with `1 << addr_bus_bits` bytes of address space, every page a
    /// memory page costing `cycles_per_access`
    pub fn with_uniform_pages(
        page_shift: u32,
        addr_bus_bits: u32,
        cycles_per_access: u32,
        io: Box<dyn IoDevices>,
    ) -> Self {
        let count = 1usize << addr_bus_bits.saturating_sub(page_shift);
        Self::new(page_shift, addr_bus_bits, vec![Page::memory(cycles_per_access); count], io)
    }

    pub fn mem_mask(&self) -> u32 {
        self.mem_mask
    }

    pub fn open_bus(&self) -> u8 {
        self.open_bus
    }

    pub fn set_io_devices(&mut self, io: Box<dyn IoDevices>) {
        self.io = io;
    }

    pub fn map(
        &mut self,
        addr: u32,
        block: &MemoryBlock,
        offset: usize,
        len: u32,
        read_only: bool,
    ) -> Result<(), BusError> {
        self.memory.map(addr & self.mem_mask, block, offset, len, read_only)
    }

    /// Read a byte, returning it together with the page's access cost
    #[inline]
    pub fn read_byte(&mut self, addr: u32) -> (u8, u32) {
        if !self.open_bus_is_data {
            self.open_bus = addr as u8;
        }
        let addr = addr & self.mem_mask;
        let page = self.memory.page(addr);
        let cycles = page.cycles_per_access;
        if page.is_io(addr) {
            let mut data = self.open_bus;
            self.io.read(addr, &mut data, &mut self.memory);
            self.open_bus = data;
        } else if let Some(v) = self.memory.read(addr) {
            self.open_bus = v;
        }
        (self.open_bus, cycles)
    }

    /// Write a byte, returning the page's access cost
    #[inline]
    pub fn write_byte(&mut self, addr: u32, value: u8) -> u32 {
        let addr = addr & self.mem_mask;
        let page = self.memory.page(addr);
        let cycles = page.cycles_per_access;
        if page.is_io(addr) {
            self.io.write(addr, value, &mut self.memory);
        } else {
            self.memory.write(addr, value);
        }
        self.open_bus = if self.open_bus_is_data { value } else { addr as u8 };
        cycles
    }

    /// Read the backing store even if the page is I/O routed
    pub fn read_byte_no_io(&mut self, addr: u32) -> (u8, u32) {
        let addr = addr & self.mem_mask;
        let cycles = self.memory.page(addr).cycles_per_access;
        if let Some(v) = self.memory.read(addr) {
            self.open_bus = v;
        }
        (self.open_bus, cycles)
    }

    /// Write the backing store even if the page is I/O routed
    pub fn write_byte_no_io(&mut self, addr: u32, value: u8) -> u32 {
        let addr = addr & self.mem_mask;
        let cycles = self.memory.page(addr).cycles_per_access;
        self.memory.write(addr, value);
        cycles
    }

    /// Would an access to `addr` reach an I/O device?
    pub fn query_io(&self, addr: u32) -> bool {
        let addr = addr & self.mem_mask;
        self.memory.page(addr).is_io(addr) && self.io.is_io_device_address(addr)
    }

    /// Side-effect free read: never touches I/O or the open-bus latch.
    /// I/O and unmapped addresses report the current open-bus value.
    pub fn peek_byte(&self, addr: u32) -> u8 {
        let addr = addr & self.mem_mask;
        if self.memory.page(addr).is_io(addr) {
            return self.open_bus;
        }
        self.memory.read(addr).unwrap_or(self.open_bus)
    }

    pub fn irq_taken(&mut self, kind: InterruptKind) {
        self.io.irq_taken(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ram_bus() -> (SystemBus, MemoryBlock) {
        // 16 pages of 256 bytes, first 8 backed by RAM
        let mut bus = SystemBus::with_uniform_pages(8, 12, 3, Box::new(NoIo));
        let ram = MemoryBlock::new(0x800);
        bus.map(0, &ram, 0, 0x800, false).unwrap();
        (bus, ram)
    }

    /// Device with a single register at 0x0F00 and a fallthrough to RAM elsewhere
    struct Latch {
        reg: u8,
        reads: u32,
    }

    impl IoDevices for Latch {
        fn is_io_device_address(&self, addr: u32) -> bool {
            addr == 0x0F00
        }

        fn read(&mut self, addr: u32, data: &mut u8, memory: &mut MemoryMap) {
            self.reads += 1;
            if addr == 0x0F00 {
                *data = self.reg;
            } else if let Some(v) = memory.read(addr) {
                *data = v;
            }
        }

        fn write(&mut self, addr: u32, value: u8, memory: &mut MemoryMap) {
            if addr == 0x0F00 {
                self.reg = value;
            } else {
                memory.write(addr, value);
            }
        }
    }

    #[test]
    fn test_round_trip_and_cycles() {
        let (mut bus, ram) = ram_bus();
        assert_eq!(bus.write_byte(0x123, 0x42), 3);
        assert_eq!(bus.read_byte(0x123), (0x42, 3));
        assert_eq!(ram.read(0x123), 0x42);
    }

    #[test]
    fn test_address_is_masked_to_bus_width() {
        let (mut bus, _ram) = ram_bus();
        bus.write_byte(0x1010, 7);
        assert_eq!(bus.read_byte(0x0010).0, 7);
    }

    #[test]
    fn test_unmapped_read_returns_open_bus() {
        let (mut bus, _ram) = ram_bus();
        bus.write_byte(0x10, 0x5A);
        bus.read_byte(0x10);
        assert_eq!(bus.read_byte(0x900).0, 0x5A);
        // A write to unmapped space is dropped but still drives the bus
        bus.write_byte(0x900, 0x77);
        assert_eq!(bus.read_byte(0xA00).0, 0x77);
    }

    #[test]
    fn test_open_bus_address_mode() {
        let (mut bus, _ram) = ram_bus();
        bus.open_bus_is_data = false;
        bus.write_byte(0x10, 0x5A);
        assert_eq!(bus.open_bus(), 0x10);
        assert_eq!(bus.read_byte(0x934).0, 0x34);
    }

    #[test]
    fn test_read_only_page() {
        let mut bus = SystemBus::with_uniform_pages(8, 12, 1, Box::new(NoIo));
        let rom = MemoryBlock::from_bytes(&[0xAA; 0x100]);
        bus.map(0x100, &rom, 0, 0x100, true).unwrap();
        bus.write_byte(0x105, 0x00);
        assert_eq!(bus.read_byte(0x105).0, 0xAA);
        bus.write_byte_no_io(0x105, 0x00);
        assert_eq!(rom.read(5), 0xAA);
    }

    #[test]
    fn test_mirrors_share_storage() {
        let mut bus = SystemBus::with_uniform_pages(8, 12, 1, Box::new(NoIo));
        let ram = MemoryBlock::new(0x100);
        bus.map(0x000, &ram, 0, 0x100, false).unwrap();
        bus.map(0x100, &ram, 0, 0x100, false).unwrap();
        bus.write_byte(0x012, 9);
        assert_eq!(bus.read_byte(0x112).0, 9);
    }

    #[test]
    fn test_map_rejects_bad_regions() {
        let mut bus = SystemBus::with_uniform_pages(8, 12, 1, Box::new(NoIo));
        let ram = MemoryBlock::new(0x100);
        assert!(matches!(bus.map(0x10, &ram, 0, 0x100, false), Err(BusError::Unaligned { .. })));
        assert!(matches!(bus.map(0, &ram, 0, 0x80, false), Err(BusError::BadLength { .. })));
        assert!(matches!(bus.map(0, &ram, 0, 0x200, false), Err(BusError::BackingTooShort { .. })));
        assert!(matches!(bus.map(0xF00, &ram, 0, 0x200, false), Err(BusError::OutOfRange { .. })));
    }

    #[test]
    fn test_io_routing_and_no_io_paths() {
        let mut pages = vec![Page::memory(1); 16];
        pages[15] = Page::io(4);
        let mut bus = SystemBus::new(8, 12, pages, Box::new(Latch { reg: 0x33, reads: 0 }));
        let ram = MemoryBlock::new(0x1000);
        bus.map(0, &ram, 0, 0x1000, false).unwrap();

        assert_eq!(bus.read_byte(0xF00), (0x33, 4));
        bus.write_byte(0xF00, 0x44);
        assert_eq!(bus.read_byte(0xF00).0, 0x44);

        // The device falls through to RAM for the rest of the page
        bus.write_byte(0xF10, 0x99);
        assert_eq!(ram.read(0xF10), 0x99);

        // NoIo variants bypass the device entirely
        bus.write_byte_no_io(0xF00, 0x11);
        assert_eq!(bus.read_byte_no_io(0xF00).0, 0x11);
        assert_eq!(bus.read_byte(0xF00).0, 0x44);

        assert!(bus.query_io(0xF00));
        assert!(!bus.query_io(0xF10));
        assert!(!bus.query_io(0x010));
    }

    #[test]
    fn test_partial_io_page() {
        let mut pages = vec![Page::memory(1); 16];
        // Only the low 32 bytes of page 4 are registers
        pages[4] = Page::io_partial(0xFFE0, 0x400, 1);
        let mut bus = SystemBus::new(8, 12, pages, Box::new(Latch { reg: 1, reads: 0 }));
        assert!(bus.memory.page(0x400).is_io(0x41F));
        assert!(!bus.memory.page(0x400).is_io(0x420));
        bus.read_byte(0x41F);
    }

    #[test]
    fn test_peek_has_no_side_effects() {
        let mut pages = vec![Page::memory(1); 16];
        pages[15] = Page::io(1);
        let mut bus = SystemBus::new(8, 12, pages, Box::new(Latch { reg: 0x33, reads: 0 }));
        let ram = MemoryBlock::from_bytes(&[0x12; 0x100]);
        bus.map(0, &ram, 0, 0x100, false).unwrap();
        bus.write_byte(0x20, 0x80);
        assert_eq!(bus.peek_byte(0xF00), 0x80);
        assert_eq!(bus.peek_byte(0x21), 0x12);
        assert_eq!(bus.open_bus(), 0x80);
    }

    #[test]
    fn test_code_pages_report_writes_and_remaps() {
        let mut bus = SystemBus::with_uniform_pages(8, 12, 1, Box::new(NoIo));
        let ram = MemoryBlock::new(0x100);
        bus.map(0x000, &ram, 0, 0x100, false).unwrap();
        bus.map(0x300, &ram, 0, 0x100, false).unwrap();
        bus.memory.mark_code(0x000);
        assert!(bus.memory.page(0x300).flags & Page::HAS_CODE != 0);

        // Written through the mirror: both aliases go stale
        bus.write_byte(0x305, 1);
        assert_eq!(bus.memory.take_dirty_code(), vec![0, 3]);
        assert_eq!(bus.memory.page(0x000).flags & Page::HAS_CODE, 0);

        bus.memory.mark_code(0x000);
        let other = MemoryBlock::new(0x100);
        bus.map(0x000, &other, 0, 0x100, false).unwrap();
        assert_eq!(bus.memory.take_dirty_code(), vec![0]);
    }

    proptest! {
        #[test]
        fn prop_ram_round_trip(addr in 0u32..0x800, value: u8) {
            let (mut bus, _ram) = ram_bus();
            bus.write_byte(addr, value);
            prop_assert_eq!(bus.read_byte(addr).0, value);
        }

        #[test]
        fn prop_read_only_never_changes(writes in proptest::collection::vec((0u32..0x100, any::<u8>()), 1..32)) {
            let mut bus = SystemBus::with_uniform_pages(8, 12, 1, Box::new(NoIo));
            let rom = MemoryBlock::from_bytes(&[0x5C; 0x100]);
            bus.map(0x200, &rom, 0, 0x100, true).unwrap();
            for (offset, value) in writes {
                bus.write_byte(0x200 + offset, value);
            }
            prop_assert!(rom.to_vec().iter().all(|&b| b == 0x5C));
        }

        #[test]
        fn prop_open_bus_persists(addr in 0u32..0x800, value: u8, unmapped in 0x800u32..0x1000) {
            let (mut bus, _ram) = ram_bus();
            bus.write_byte(addr, value);
            prop_assert_eq!(bus.read_byte(unmapped).0, value);
        }
    }
}
