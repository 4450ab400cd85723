//! CPU core: registers, interrupt/DMA bookkeeping, and the pagetable +
//! handler-table memory map (§3.2, §4.1). Grounded on
//! `original_source/main/cpu.c` and `include/cpu.h`; the dispatch shape
//! (tagged `Component` instead of function pointers, arena ownership
//! instead of raw pointers) follows §9's Design Notes.

pub mod exec;

use bincode::{Decode, Encode};

pub const PAGE_SHIFT: u32 = 10;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_COUNT: usize = 0x10000 / PAGE_SIZE;

pub const VECTOR_NMI: u16 = 0xFFFA;
pub const VECTOR_RESET: u16 = 0xFFFC;
pub const VECTOR_IRQ: u16 = 0xFFFE;

/// Interrupt lines, matching `include/cpu.h`'s `IRQ_*` numbering. Order is
/// the dispatch priority used when more than one line is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[repr(u8)]
pub enum IrqLine {
    Reset = 0,
    Nmi = 1,
    NmiImmediate = 2,
    M2Timer = 3,
    A12Timer = 4,
    Mmc5Timer = 5,
    ApuFrame = 6,
    ApuDmc = 7,
    Disk = 8,
    Mmc5Pcm = 9,
}

pub const IRQ_LINE_COUNT: usize = 10;

impl IrqLine {
    pub const ALL: [IrqLine; IRQ_LINE_COUNT] = [
        IrqLine::Reset,
        IrqLine::Nmi,
        IrqLine::NmiImmediate,
        IrqLine::M2Timer,
        IrqLine::A12Timer,
        IrqLine::Mmc5Timer,
        IrqLine::ApuFrame,
        IrqLine::ApuDmc,
        IrqLine::Disk,
        IrqLine::Mmc5Pcm,
    ];

    #[must_use]
    pub fn is_nmi(self) -> bool {
        matches!(self, Self::Nmi | Self::NmiImmediate)
    }

    #[must_use]
    pub fn is_reset(self) -> bool {
        matches!(self, Self::Reset)
    }
}

/// Every bus address is ultimately owned by one subsystem. Dispatch is a
/// single exhaustive match on this tag rather than an indirect call
/// through a function pointer or trait object (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Component {
    InternalRam,
    PpuRegisters,
    ApuPulse0,
    ApuPulse1,
    ApuTriangle,
    ApuNoise,
    ApuDmc,
    ApuStatus,
    ApuFrameCounter,
    OamDma,
    Vrc6,
    Vrc7,
    Fds,
    Mmc5,
    Namco163,
    Sunsoft5b,
    /// Installed by a host frontend/mapper outside this crate's scope
    /// (generic cartridge ROM/RAM, PRG banking, PPU bus). The core treats
    /// reads/writes tagged this way as open-bus/dropped, since the general
    /// mapper catalogue is out of scope here.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct StatusFlags {
    pub negative: bool,
    pub overflow: bool,
    pub decimal: bool,
    pub interrupt_disable: bool,
    pub zero: bool,
    pub carry: bool,
}

impl StatusFlags {
    #[must_use]
    pub fn to_byte(self, break_flag: bool) -> u8 {
        (u8::from(self.negative) << 7)
            | (u8::from(self.overflow) << 6)
            | (1 << 5)
            | (u8::from(break_flag) << 4)
            | (u8::from(self.decimal) << 3)
            | (u8::from(self.interrupt_disable) << 2)
            | (u8::from(self.zero) << 1)
            | u8::from(self.carry)
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            negative: byte & 0x80 != 0,
            overflow: byte & 0x40 != 0,
            decimal: byte & 0x08 != 0,
            interrupt_disable: byte & 0x04 != 0,
            zero: byte & 0x02 != 0,
            carry: byte & 0x01 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub p: StatusFlags,
    pub pc: u16,
    /// Shadow of the last byte transferred on the bus; returned verbatim
    /// from unmapped addresses (open-bus behavior, §7).
    pub data_bus: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum DmcDmaStep {
    None,
    Rdy,
    Dummy,
    Align,
    Xfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct DmaState {
    pub dmc_dma_timestamp: u32,
    pub dmc_dma_addr: u16,
    pub dmc_dma_step: DmcDmaStep,
    /// 256 == idle; < 256 == index of the next byte to transfer.
    pub oam_dma_step: u16,
    pub oam_dma_page: u8,
    pub oam_dma_odd_start: bool,
}

impl Default for DmaState {
    fn default() -> Self {
        Self {
            dmc_dma_timestamp: u32::MAX,
            dmc_dma_addr: 0,
            dmc_dma_step: DmcDmaStep::None,
            oam_dma_step: 256,
            oam_dma_page: 0,
            oam_dma_odd_start: false,
        }
    }
}

impl DmaState {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.oam_dma_step >= 256 && matches!(self.dmc_dma_step, DmcDmaStep::None)
    }

    #[must_use]
    pub fn next_timestamp(&self) -> u32 {
        if matches!(self.dmc_dma_step, DmcDmaStep::None) {
            u32::MAX
        } else {
            self.dmc_dma_timestamp
        }
    }
}

/// One 1 KiB page's bulk backing, used as a fast path that bypasses the
/// handler table entirely (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PageEntry {
    pub readable: bool,
    pub writable: bool,
    /// Index into the owning core's flat page-backing arena.
    pub bank: Option<u16>,
}

impl Default for PageEntry {
    fn default() -> Self {
        Self { readable: false, writable: false, bank: None }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct HandlerTable {
    /// `None` at an address means no handler is installed there.
    pub read: Vec<Option<Component>>,
    pub write: Vec<Option<Component>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self { read: vec![None; 0x1_0000], write: vec![None; 0x1_0000] }
    }
}

impl HandlerTable {
    /// Installs a handler across `[addr, addr+size)`. `mask == 0` installs
    /// every address in the range; a nonzero `mask` additionally requires
    /// `(i & mask) == (addr & mask)`, the way cxnes picks a single
    /// register's mirrors out of a larger range (e.g. one PPU register
    /// repeating every 8 bytes across `$2000-$3FFF`).
    pub fn set_read(&mut self, addr: u16, size: u32, mask: u16, component: Component) {
        Self::install(&mut self.read, addr, size, mask, component);
    }

    pub fn set_write(&mut self, addr: u16, size: u32, mask: u16, component: Component) {
        Self::install(&mut self.write, addr, size, mask, component);
    }

    /// Removes a previously installed read handler across `[addr, addr+size)`,
    /// used by MMC5 PCM read mode to toggle PRG-ROM read interception on and
    /// off at runtime.
    pub fn clear_read(&mut self, addr: u16, size: u32, mask: u16) {
        Self::uninstall(&mut self.read, addr, size, mask);
    }

    fn install(
        table: &mut [Option<Component>],
        addr: u16,
        size: u32,
        mask: u16,
        component: Component,
    ) {
        // mask == 0 means "no mirroring constraint": every address in the
        // contiguous [addr, addr+size) range is installed. A nonzero mask
        // additionally requires `a`'s masked bits to match `addr`'s, which
        // is how a single register's mirrors are picked out of a larger
        // range (e.g. one PPU register repeating every 8 bytes).
        for offset in 0..size {
            let a = addr.wrapping_add(offset as u16);
            if table.get(a as usize).is_some() && (mask == 0 || (a & mask) == (addr & mask)) {
                table[a as usize] = Some(component);
            }
        }
    }

    fn uninstall(table: &mut [Option<Component>], addr: u16, size: u32, mask: u16) {
        for offset in 0..size {
            let a = addr.wrapping_add(offset as u16);
            if table.get(a as usize).is_some() && (mask == 0 || (a & mask) == (addr & mask)) {
                table[a as usize] = None;
            }
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct CpuState {
    pub regs: CpuRegisters,
    pub cycles: u32,
    pub clock_divider: u32,

    pub interrupts: u32,
    pub interrupt_times: [u32; IRQ_LINE_COUNT],
    pub interrupt_mask: u32,
    pub polled_interrupts: bool,

    pub dma: DmaState,
    pub board_run_timestamp: u32,

    pub jammed: bool,
    pub resetting: bool,

    pub read_pages: [PageEntry; PAGE_COUNT],
    pub write_pages: [PageEntry; PAGE_COUNT],
    pub handlers: HandlerTable,
}

impl CpuState {
    #[must_use]
    pub fn new(clock_divider: u32) -> Self {
        Self {
            regs: CpuRegisters::default(),
            cycles: 0,
            clock_divider,
            interrupts: 0,
            interrupt_times: [u32::MAX; IRQ_LINE_COUNT],
            interrupt_mask: !irq_mask(IrqLine::Reset) & !nmi_mask(),
            polled_interrupts: false,
            dma: DmaState::default(),
            board_run_timestamp: u32::MAX,
            jammed: false,
            resetting: false,
            read_pages: [PageEntry::default(); PAGE_COUNT],
            write_pages: [PageEntry::default(); PAGE_COUNT],
            handlers: HandlerTable::default(),
        }
    }

    #[must_use]
    pub fn is_jammed(&self) -> bool {
        self.jammed
    }

    pub fn set_pagetable_entry(
        &mut self,
        page: usize,
        readable: bool,
        writable: bool,
        bank: Option<u16>,
    ) {
        let entry = PageEntry { readable, writable, bank };
        if readable {
            self.read_pages[page] = entry;
        }
        if writable {
            self.write_pages[page] = entry;
        }
    }

    pub fn interrupt_schedule(&mut self, line: IrqLine, cycle: u32) {
        let idx = line as usize;
        self.interrupt_times[idx] = cycle;
        if cycle <= self.cycles {
            self.interrupts |= irq_mask(line);
        }
    }

    /// Recomputes `interrupt_mask` from the I flag and reset state. Called
    /// at instruction boundaries (`include/cpu.h`'s `update_interrupt_status`).
    pub fn update_interrupt_mask(&mut self) {
        self.interrupt_mask = if self.regs.p.interrupt_disable {
            nmi_mask() | irq_mask(IrqLine::Reset)
        } else {
            u32::MAX
        };
    }

    pub fn interrupt_cancel(&mut self, line: IrqLine) {
        let idx = line as usize;
        self.interrupt_times[idx] = u32::MAX;
        self.interrupts &= !irq_mask(line);
    }

    /// Clears a pending line; returns whether it had been pending.
    pub fn interrupt_ack(&mut self, line: IrqLine) -> bool {
        let mask = irq_mask(line);
        let was_pending = self.interrupts & mask != 0;
        self.interrupts &= !mask;
        was_pending
    }

    pub fn board_run_schedule(&mut self, cycle: u32) {
        self.board_run_timestamp = self.board_run_timestamp.min(cycle);
    }

    pub fn board_run_cancel(&mut self) {
        self.board_run_timestamp = u32::MAX;
    }

    pub fn set_dmc_dma_timestamp(&mut self, cycle: u32, addr: u16, immediate: bool) {
        self.dma.dmc_dma_addr = addr;
        self.dma.dmc_dma_timestamp = cycle;
        self.dma.dmc_dma_step = if immediate { DmcDmaStep::Dummy } else { DmcDmaStep::Rdy };
    }

    pub fn oam_dma(&mut self, page: u8, odd_cycle: bool) {
        self.dma.oam_dma_page = page;
        self.dma.oam_dma_step = 0;
        self.dma.oam_dma_odd_start = odd_cycle;
    }

    /// Next cycle at which the CPU's inner loop must stop and re-evaluate
    /// deadlines: the earliest of frame end, any pending interrupt, and
    /// any scheduled board-run callback (§4.1, §4.4 rule 2).
    #[must_use]
    pub fn calculate_step_cycles(&self, frame_cycles: u32) -> u32 {
        let mut step = frame_cycles;
        step = step.min(self.board_run_timestamp);
        step = step.min(self.dma.next_timestamp());
        for line in IrqLine::ALL {
            let idx = line as usize;
            if self.interrupts & irq_mask(line) == 0 {
                step = step.min(self.interrupt_times[idx]);
            }
        }
        step
    }

    pub fn end_frame(&mut self, frame_cycles: u32) {
        self.cycles = self.cycles.saturating_sub(frame_cycles);
        for t in &mut self.interrupt_times {
            if *t != u32::MAX {
                *t = t.saturating_sub(frame_cycles);
            }
        }
        if self.board_run_timestamp != u32::MAX {
            self.board_run_timestamp = self.board_run_timestamp.saturating_sub(frame_cycles);
        }
        if self.dma.dmc_dma_timestamp != u32::MAX {
            self.dma.dmc_dma_timestamp = self.dma.dmc_dma_timestamp.saturating_sub(frame_cycles);
        }
    }

    /// Hard reset zeroes persistent state; soft reset only reinitializes
    /// volatile sequencing state and asserts the RESET line (§5).
    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.regs = CpuRegisters::default();
            self.dma = DmaState::default();
            self.jammed = false;
        }
        self.cycles = 0;
        self.interrupts = irq_mask(IrqLine::Reset);
        self.interrupt_mask = !nmi_mask();
        self.polled_interrupts = false;
        self.resetting = true;
    }
}

#[must_use]
pub fn irq_mask(line: IrqLine) -> u32 {
    1 << (line as u8)
}

#[must_use]
pub fn nmi_mask() -> u32 {
    irq_mask(IrqLine::Nmi) | irq_mask(IrqLine::NmiImmediate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmi_is_never_masked_by_the_interrupt_disable_flag() {
        let mut cpu = CpuState::new(12);
        cpu.regs.p.interrupt_disable = true;
        cpu.update_interrupt_mask();
        cpu.cycles = 3000;
        cpu.interrupt_schedule(IrqLine::Nmi, 3000);

        assert_ne!(cpu.interrupts & cpu.interrupt_mask & irq_mask(IrqLine::Nmi), 0);
    }

    #[test]
    fn irq_is_masked_by_the_interrupt_disable_flag() {
        let mut cpu = CpuState::new(12);
        cpu.regs.p.interrupt_disable = true;
        cpu.update_interrupt_mask();
        cpu.cycles = 3000;
        cpu.interrupt_schedule(IrqLine::ApuFrame, 3000);

        assert_eq!(cpu.interrupts & cpu.interrupt_mask & irq_mask(IrqLine::ApuFrame), 0);
    }

    #[test]
    fn reset_outranks_every_other_pending_line() {
        let mut cpu = CpuState::new(12);
        cpu.interrupt_schedule(IrqLine::Reset, 0);
        cpu.interrupt_schedule(IrqLine::Nmi, 0);
        cpu.interrupt_schedule(IrqLine::ApuFrame, 0);

        let highest = IrqLine::ALL.into_iter().find(|&line| cpu.interrupts & irq_mask(line) != 0);
        assert_eq!(highest, Some(IrqLine::Reset));
    }

    #[test]
    fn handler_table_install_respects_mirrored_range_mask() {
        // A single register mirrored every 8 bytes across an 8 KiB window,
        // the way PPU register $2000 repeats through $2000-$3FFF.
        let mut handlers = HandlerTable::default();
        handlers.set_write(0x2000, 0x2000, 7, Component::PpuRegisters);

        assert_eq!(handlers.write[0x2000], Some(Component::PpuRegisters));
        assert_eq!(handlers.write[0x2008], Some(Component::PpuRegisters));
        assert_eq!(handlers.write[0x3ff8], Some(Component::PpuRegisters));
        assert_eq!(handlers.write[0x2001], None);
        assert_eq!(handlers.write[0x4000], None);
    }

    #[test]
    fn clear_read_undoes_a_prior_install() {
        let mut handlers = HandlerTable::default();
        handlers.set_read(0x8000, 0x4000, 0, Component::Mmc5);
        assert_eq!(handlers.read[0x8000], Some(Component::Mmc5));
        assert_eq!(handlers.read[0xbfff], Some(Component::Mmc5));

        handlers.clear_read(0x8000, 0x4000, 0);
        assert_eq!(handlers.read[0x8000], None);
        assert_eq!(handlers.read[0xbfff], None);
    }
}
