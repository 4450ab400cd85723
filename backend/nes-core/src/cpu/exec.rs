//! Instruction decode/execute loop, addressing modes, and the full
//! (including undocumented) opcode table. Grounded on
//! `original_source/main/cpu.c`'s `cpu_run`, addressing-mode helpers,
//! `branch`, and `brk`. Every internal bus cycle goes through
//! [`NesCore::read_bus`]/[`NesCore::write_bus`], which is where the
//! pagetable + handler-table dispatch and the DMA fast path live (§4.1).

use crate::cpu::{irq_mask, DmcDmaStep, IrqLine, VECTOR_IRQ, VECTOR_NMI, VECTOR_RESET};
use crate::NesCore;

impl NesCore {
    /// Advances the CPU until at least `frame_cycles` master clocks have
    /// elapsed, servicing DMA and interrupts along the way. Returns the
    /// final cycle count, matching the `run() -> cycles_consumed` contract.
    pub fn run_cpu(&mut self, frame_cycles: u32) -> u32 {
        loop {
            let step_cycles = self.cpu.calculate_step_cycles(frame_cycles);

            if self.cpu.dma.oam_dma_step < 256 {
                self.service_oam_dma_byte();
                if self.cpu.cycles > step_cycles {
                    continue;
                }
            }

            if self.cpu.cycles > step_cycles {
                break;
            }

            if self.cpu.jammed {
                // A jammed CPU idles; time still has to advance so the
                // rest of the system (APU, expansion audio) keeps running.
                self.cpu.cycles = step_cycles.max(self.cpu.cycles + self.cpu.clock_divider);
                continue;
            }

            self.step_instruction();

            if self.cpu.cycles > frame_cycles
                && self.cpu.board_run_timestamp > frame_cycles
                && self.cpu.dma.next_timestamp() > frame_cycles
                && !self.cpu.interrupt_lines_due()
            {
                break;
            }
        }

        self.cpu.cycles
    }

    fn service_oam_dma_byte(&mut self) {
        let step = self.cpu.dma.oam_dma_step;

        if step == 0 && !self.cpu.dma.oam_dma_odd_start {
            // One wait cycle on an even start, two on an odd start; the
            // odd-start extra wait cycle is consumed below before step 0.
        }
        if step == 0 {
            // Wait cycle(s) before the transfer proper.
            let _ = self.read_bus(self.cpu.regs.pc);
            if self.cpu.dma.oam_dma_odd_start {
                let _ = self.read_bus(self.cpu.regs.pc);
            }
        }

        let src = (u16::from(self.cpu.dma.oam_dma_page) << 8) | (step & 0xFF);
        let value = self.read_bus(src);
        self.write_bus(0x2004, value);

        self.cpu.dma.oam_dma_step = step + 1;
        if self.cpu.dma.oam_dma_step >= 256 {
            self.cpu.dma.oam_dma_step = 256;
        }
    }

    /// Services a due DMC DMA step if one is pending; called from inside
    /// every `read_bus`/`write_bus` as the fast-path check (§4.1 DMC DMA).
    fn service_dma_if_due(&mut self) {
        if matches!(self.cpu.dma.dmc_dma_step, DmcDmaStep::None) {
            return;
        }
        if self.cpu.dma.dmc_dma_timestamp > self.cpu.cycles {
            return;
        }

        match self.cpu.dma.dmc_dma_step {
            DmcDmaStep::Rdy => self.cpu.dma.dmc_dma_step = DmcDmaStep::Dummy,
            DmcDmaStep::Dummy => self.cpu.dma.dmc_dma_step = DmcDmaStep::Align,
            DmcDmaStep::Align => self.cpu.dma.dmc_dma_step = DmcDmaStep::Xfer,
            DmcDmaStep::Xfer => {
                let addr = self.cpu.dma.dmc_dma_addr;
                let value = self.read_bus_raw(addr);
                self.cpu.dma.dmc_dma_step = DmcDmaStep::None;
                self.cpu.dma.dmc_dma_timestamp = u32::MAX;
                self.apu_dmc_load_buf(value);
            }
            DmcDmaStep::None => {}
        }
    }

    /// A read that does not itself re-enter the DMA fast path; used for
    /// the DMC DMA's own fetch.
    fn read_bus_raw(&mut self, addr: u16) -> u8 {
        let page = (addr as usize) >> crate::cpu::PAGE_SHIFT;
        let mut value = self.cpu.regs.data_bus;
        let entry = self.cpu.read_pages[page];
        if entry.readable {
            if let Some(bank) = entry.bank {
                value = self.read_page_bank(bank, addr);
            }
        }
        if let Some(component) = self.cpu.handlers.read[addr as usize] {
            value = self.dispatch_read(component, addr, value);
        }
        self.cpu.regs.data_bus = value;
        self.cpu.cycles += self.cpu.clock_divider;
        value
    }

    pub(crate) fn read_bus(&mut self, addr: u16) -> u8 {
        self.service_dma_if_due();
        self.read_bus_raw(addr)
    }

    /// Side-effect-free memory inspection: resolves the page-table bank a
    /// debugger or frontend would see, without advancing the clock, polling
    /// DMA, or invoking any handler (so it can never itself trigger a PCM
    /// IRQ or any other handler side effect). Mirrors cxnes's `cpu_peek`.
    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        let page = (addr as usize) >> crate::cpu::PAGE_SHIFT;
        let mut value = self.cpu.regs.data_bus;
        let entry = self.cpu.read_pages[page];
        if entry.readable {
            if let Some(bank) = entry.bank {
                value = self.read_page_bank(bank, addr);
            }
        }
        value
    }

    pub(crate) fn write_bus(&mut self, addr: u16, value: u8) {
        self.service_dma_if_due();
        self.cpu.regs.data_bus = value;

        if let Some(component) = self.cpu.handlers.write[addr as usize] {
            self.dispatch_write(component, addr, value);
        }

        let page = (addr as usize) >> crate::cpu::PAGE_SHIFT;
        let entry = self.cpu.write_pages[page];
        if entry.writable {
            if let Some(bank) = entry.bank {
                self.write_page_bank(bank, addr, value);
            }
        }

        self.cpu.cycles += self.cpu.clock_divider;
    }

    fn fetch_u8(&mut self) -> u8 {
        let pc = self.cpu.regs.pc;
        let value = self.read_bus(pc);
        self.cpu.regs.pc = pc.wrapping_add(1);
        value
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8();
        let hi = self.fetch_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn push(&mut self, value: u8) {
        let addr = 0x0100 | u16::from(self.cpu.regs.s);
        self.write_bus(addr, value);
        self.cpu.regs.s = self.cpu.regs.s.wrapping_sub(1);
    }

    fn pull(&mut self) -> u8 {
        self.cpu.regs.s = self.cpu.regs.s.wrapping_add(1);
        let addr = 0x0100 | u16::from(self.cpu.regs.s);
        self.read_bus(addr)
    }

    fn poll_interrupts(&mut self) -> bool {
        self.cpu.update_interrupt_mask();
        self.cpu.interrupts & self.cpu.interrupt_mask != 0
    }

    fn highest_priority_pending(&self) -> IrqLine {
        for line in IrqLine::ALL {
            if self.cpu.interrupts & self.cpu.interrupt_mask & irq_mask(line) != 0 {
                return line;
            }
        }
        unreachable!("poll_interrupts guarantees at least one line is pending")
    }

    /// Executes one instruction, substituting a synthetic BRK-style
    /// sequence if an honored interrupt is pending at the fetch boundary
    /// (§4.1 step 3).
    fn step_instruction(&mut self) {
        if !self.cpu.polled_interrupts && self.poll_interrupts() {
            let line = self.highest_priority_pending();
            self.dispatch_interrupt(line);
            self.cpu.polled_interrupts = false;
            return;
        }
        self.cpu.polled_interrupts = false;

        let opcode = self.fetch_u8();
        self.execute(opcode);
    }

    fn dispatch_interrupt(&mut self, line: IrqLine) {
        let pc = self.cpu.regs.pc;

        if line.is_reset() {
            // A reset does not push state or read a vector through the
            // normal sequence timing in hardware, but it does consume the
            // same number of bus cycles before jumping.
            let _ = self.read_bus(pc);
            let _ = self.read_bus(pc);
            self.cpu.regs.s = self.cpu.regs.s.wrapping_sub(3);
            self.cpu.regs.p.interrupt_disable = true;
            self.cpu.interrupt_ack(IrqLine::Reset);
            self.cpu.resetting = false;
            let target = self.read_vector(VECTOR_RESET);
            self.cpu.regs.pc = target;
            return;
        }

        let _ = self.read_bus(pc);
        self.push((pc >> 8) as u8);
        self.push(pc as u8);
        self.push(self.cpu.regs.p.to_byte(false));
        self.cpu.regs.p.interrupt_disable = true;

        let vector = if line.is_nmi() {
            self.cpu.interrupt_ack(IrqLine::Nmi);
            self.cpu.interrupt_ack(IrqLine::NmiImmediate);
            VECTOR_NMI
        } else {
            self.cpu.interrupt_ack(line);
            VECTOR_IRQ
        };
        self.cpu.regs.pc = self.read_vector(vector);
    }

    fn read_vector(&mut self, vector: u16) -> u16 {
        let lo = self.read_bus(vector);
        let hi = self.read_bus(vector + 1);
        u16::from_le_bytes([lo, hi])
    }

    fn set_nz(&mut self, value: u8) {
        self.cpu.regs.p.zero = value == 0;
        self.cpu.regs.p.negative = value & 0x80 != 0;
    }

    // --- addressing modes ---
    // Each resolver performs exactly the bus cycles real hardware would,
    // including the dummy read before a page-crossing indexed access.

    fn addr_zero_page(&mut self) -> u16 {
        u16::from(self.fetch_u8())
    }

    fn addr_zero_page_indexed(&mut self, index: u8) -> u16 {
        let base = self.fetch_u8();
        let _ = self.read_bus(u16::from(base));
        u16::from(base.wrapping_add(index))
    }

    fn addr_absolute(&mut self) -> u16 {
        self.fetch_u16()
    }

    /// Returns the effective address. `always_extra_cycle` mirrors the
    /// hardware fact that RMW/store instructions always perform the
    /// dummy high-byte-fixup read, while pure loads only do it when the
    /// page actually changes.
    fn addr_absolute_indexed(&mut self, index: u8, always_extra_cycle: bool) -> u16 {
        let base = self.fetch_u16();
        let effective = base.wrapping_add(u16::from(index));
        let page_crossed = (base & 0xFF00) != (effective & 0xFF00);
        if page_crossed || always_extra_cycle {
            let dummy = (base & 0xFF00) | (effective & 0x00FF);
            let _ = self.read_bus(dummy);
        }
        effective
    }

    fn addr_indexed_indirect(&mut self) -> u16 {
        // (zp,X)
        let zp = self.fetch_u8();
        let _ = self.read_bus(u16::from(zp));
        let ptr = zp.wrapping_add(self.cpu.regs.x);
        let lo = self.read_bus(u16::from(ptr));
        let hi = self.read_bus(u16::from(ptr.wrapping_add(1)));
        u16::from_le_bytes([lo, hi])
    }

    fn addr_indirect_indexed(&mut self, always_extra_cycle: bool) -> u16 {
        // (zp),Y
        let zp = self.fetch_u8();
        let lo = self.read_bus(u16::from(zp));
        let hi = self.read_bus(u16::from(zp.wrapping_add(1)));
        let base = u16::from_le_bytes([lo, hi]);
        let effective = base.wrapping_add(u16::from(self.cpu.regs.y));
        let page_crossed = (base & 0xFF00) != (effective & 0xFF00);
        if page_crossed || always_extra_cycle {
            let dummy = (base & 0xFF00) | (effective & 0x00FF);
            let _ = self.read_bus(dummy);
        }
        effective
    }

    fn read_modify_write(&mut self, addr: u16, op: impl FnOnce(&mut Self, u8) -> u8) {
        let old = self.read_bus(addr);
        self.write_bus(addr, old);
        let new = op(self, old);
        self.write_bus(addr, new);
    }

    fn branch(&mut self, condition: bool) {
        let offset = self.fetch_u8() as i8;

        if !self.cpu.polled_interrupts {
            // Interrupts are sampled before the taken-branch's
            // add-and-fetch micro-op (§4.1 "Interrupt sampling").
            if self.poll_interrupts() {
                self.cpu.polled_interrupts = true;
            }
        }

        if !condition {
            return;
        }

        let pc = self.cpu.regs.pc;
        let _ = self.read_bus(pc);
        let target = pc.wrapping_add(offset as u16);
        if target & 0xFF00 != pc & 0xFF00 {
            let fixup = (pc & 0xFF00) | (target & 0x00FF);
            let _ = self.read_bus(fixup);
        }
        self.cpu.regs.pc = target;
    }

    fn execute(&mut self, opcode: u8) {
        macro_rules! load {
            ($addr:expr, $reg:ident) => {{
                let value = self.read_bus($addr);
                self.cpu.regs.$reg = value;
                self.set_nz(value);
            }};
        }

        match opcode {
            // --- official loads/stores ---
            0xA9 => {
                let v = self.fetch_u8();
                self.cpu.regs.a = v;
                self.set_nz(v);
            }
            0xA5 => {
                let a = self.addr_zero_page();
                load!(a, a);
            }
            0xB5 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                load!(a, a);
            }
            0xAD => {
                let a = self.addr_absolute();
                load!(a, a);
            }
            0xBD => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, false);
                load!(a, a);
            }
            0xB9 => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                load!(a, a);
            }
            0xA1 => {
                let a = self.addr_indexed_indirect();
                load!(a, a);
            }
            0xB1 => {
                let a = self.addr_indirect_indexed(false);
                load!(a, a);
            }

            0xA2 => {
                let v = self.fetch_u8();
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xA6 => {
                let a = self.addr_zero_page();
                load!(a, x);
            }
            0xB6 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.y);
                load!(a, x);
            }
            0xAE => {
                let a = self.addr_absolute();
                load!(a, x);
            }
            0xBE => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                load!(a, x);
            }

            0xA0 => {
                let v = self.fetch_u8();
                self.cpu.regs.y = v;
                self.set_nz(v);
            }
            0xA4 => {
                let a = self.addr_zero_page();
                load!(a, y);
            }
            0xB4 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                load!(a, y);
            }
            0xAC => {
                let a = self.addr_absolute();
                load!(a, y);
            }
            0xBC => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, false);
                load!(a, y);
            }

            0x85 => {
                let a = self.addr_zero_page();
                self.write_bus(a, self.cpu.regs.a);
            }
            0x95 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.write_bus(a, self.cpu.regs.a);
            }
            0x8D => {
                let a = self.addr_absolute();
                self.write_bus(a, self.cpu.regs.a);
            }
            0x9D => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.write_bus(a, self.cpu.regs.a);
            }
            0x99 => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.write_bus(a, self.cpu.regs.a);
            }
            0x81 => {
                let a = self.addr_indexed_indirect();
                self.write_bus(a, self.cpu.regs.a);
            }
            0x91 => {
                let a = self.addr_indirect_indexed(true);
                self.write_bus(a, self.cpu.regs.a);
            }

            0x86 => {
                let a = self.addr_zero_page();
                self.write_bus(a, self.cpu.regs.x);
            }
            0x96 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.y);
                self.write_bus(a, self.cpu.regs.x);
            }
            0x8E => {
                let a = self.addr_absolute();
                self.write_bus(a, self.cpu.regs.x);
            }

            0x84 => {
                let a = self.addr_zero_page();
                self.write_bus(a, self.cpu.regs.y);
            }
            0x94 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.write_bus(a, self.cpu.regs.y);
            }
            0x8C => {
                let a = self.addr_absolute();
                self.write_bus(a, self.cpu.regs.y);
            }

            // --- transfers ---
            0xAA => {
                self.cpu.regs.x = self.cpu.regs.a;
                self.set_nz(self.cpu.regs.x);
            }
            0xA8 => {
                self.cpu.regs.y = self.cpu.regs.a;
                self.set_nz(self.cpu.regs.y);
            }
            0xBA => {
                self.cpu.regs.x = self.cpu.regs.s;
                self.set_nz(self.cpu.regs.x);
            }
            0x8A => {
                self.cpu.regs.a = self.cpu.regs.x;
                self.set_nz(self.cpu.regs.a);
            }
            0x9A => {
                self.cpu.regs.s = self.cpu.regs.x;
            }
            0x98 => {
                self.cpu.regs.a = self.cpu.regs.y;
                self.set_nz(self.cpu.regs.a);
            }

            // --- stack ---
            0x48 => self.push(self.cpu.regs.a),
            0x08 => {
                let byte = self.cpu.regs.p.to_byte(true);
                self.push(byte);
            }
            0x68 => {
                let _ = self.read_bus(0x0100 | u16::from(self.cpu.regs.s));
                let v = self.pull();
                self.cpu.regs.a = v;
                self.set_nz(v);
            }
            0x28 => {
                let _ = self.read_bus(0x0100 | u16::from(self.cpu.regs.s));
                let byte = self.pull();
                self.cpu.regs.p = crate::cpu::StatusFlags::from_byte(byte);
            }

            // --- ALU ---
            0x69 => {
                let v = self.fetch_u8();
                self.adc(v);
            }
            0x65 => {
                let a = self.addr_zero_page();
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x75 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x6D => {
                let a = self.addr_absolute();
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x7D => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, false);
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x79 => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x61 => {
                let a = self.addr_indexed_indirect();
                let v = self.read_bus(a);
                self.adc(v);
            }
            0x71 => {
                let a = self.addr_indirect_indexed(false);
                let v = self.read_bus(a);
                self.adc(v);
            }

            0xE9 | 0xEB => {
                let v = self.fetch_u8();
                self.sbc(v);
            }
            0xE5 => {
                let a = self.addr_zero_page();
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xF5 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xED => {
                let a = self.addr_absolute();
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xFD => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, false);
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xF9 => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xE1 => {
                let a = self.addr_indexed_indirect();
                let v = self.read_bus(a);
                self.sbc(v);
            }
            0xF1 => {
                let a = self.addr_indirect_indexed(false);
                let v = self.read_bus(a);
                self.sbc(v);
            }

            0x29 => {
                let v = self.fetch_u8();
                self.cpu.regs.a &= v;
                self.set_nz(self.cpu.regs.a);
            }
            0x25 => {
                let a = self.addr_zero_page();
                let v = self.read_bus(a);
                self.cpu.regs.a &= v;
                self.set_nz(self.cpu.regs.a);
            }
            0x2D => {
                let a = self.addr_absolute();
                let v = self.read_bus(a);
                self.cpu.regs.a &= v;
                self.set_nz(self.cpu.regs.a);
            }

            0x09 => {
                let v = self.fetch_u8();
                self.cpu.regs.a |= v;
                self.set_nz(self.cpu.regs.a);
            }
            0x49 => {
                let v = self.fetch_u8();
                self.cpu.regs.a ^= v;
                self.set_nz(self.cpu.regs.a);
            }

            0xC9 => {
                let v = self.fetch_u8();
                self.compare(self.cpu.regs.a, v);
            }
            0xE0 => {
                let v = self.fetch_u8();
                self.compare(self.cpu.regs.x, v);
            }
            0xC0 => {
                let v = self.fetch_u8();
                self.compare(self.cpu.regs.y, v);
            }

            // --- increments/decrements ---
            0xE8 => {
                self.cpu.regs.x = self.cpu.regs.x.wrapping_add(1);
                self.set_nz(self.cpu.regs.x);
            }
            0xC8 => {
                self.cpu.regs.y = self.cpu.regs.y.wrapping_add(1);
                self.set_nz(self.cpu.regs.y);
            }
            0xCA => {
                self.cpu.regs.x = self.cpu.regs.x.wrapping_sub(1);
                self.set_nz(self.cpu.regs.x);
            }
            0x88 => {
                self.cpu.regs.y = self.cpu.regs.y.wrapping_sub(1);
                self.set_nz(self.cpu.regs.y);
            }
            0xE6 => {
                let a = self.addr_zero_page();
                self.read_modify_write(a, |s, old| {
                    let n = old.wrapping_add(1);
                    s.set_nz(n);
                    n
                });
            }
            0xEE => {
                let a = self.addr_absolute();
                self.read_modify_write(a, |s, old| {
                    let n = old.wrapping_add(1);
                    s.set_nz(n);
                    n
                });
            }
            0xC6 => {
                let a = self.addr_zero_page();
                self.read_modify_write(a, |s, old| {
                    let n = old.wrapping_sub(1);
                    s.set_nz(n);
                    n
                });
            }
            0xCE => {
                let a = self.addr_absolute();
                self.read_modify_write(a, |s, old| {
                    let n = old.wrapping_sub(1);
                    s.set_nz(n);
                    n
                });
            }

            // --- shifts/rotates ---
            0x0A => {
                let c = self.cpu.regs.a & 0x80 != 0;
                self.cpu.regs.a <<= 1;
                self.cpu.regs.p.carry = c;
                self.set_nz(self.cpu.regs.a);
            }
            0x06 => {
                let a = self.addr_zero_page();
                self.read_modify_write(a, |s, old| {
                    s.cpu.regs.p.carry = old & 0x80 != 0;
                    let n = old << 1;
                    s.set_nz(n);
                    n
                });
            }
            0x0E => {
                let a = self.addr_absolute();
                self.read_modify_write(a, |s, old| {
                    s.cpu.regs.p.carry = old & 0x80 != 0;
                    let n = old << 1;
                    s.set_nz(n);
                    n
                });
            }
            0x4A => {
                let c = self.cpu.regs.a & 1 != 0;
                self.cpu.regs.a >>= 1;
                self.cpu.regs.p.carry = c;
                self.set_nz(self.cpu.regs.a);
            }
            0x46 => {
                let a = self.addr_zero_page();
                self.read_modify_write(a, |s, old| {
                    s.cpu.regs.p.carry = old & 1 != 0;
                    let n = old >> 1;
                    s.set_nz(n);
                    n
                });
            }
            0x4E => {
                let a = self.addr_absolute();
                self.read_modify_write(a, |s, old| {
                    s.cpu.regs.p.carry = old & 1 != 0;
                    let n = old >> 1;
                    s.set_nz(n);
                    n
                });
            }
            0x2A => {
                let carry_in = u8::from(self.cpu.regs.p.carry);
                self.cpu.regs.p.carry = self.cpu.regs.a & 0x80 != 0;
                self.cpu.regs.a = (self.cpu.regs.a << 1) | carry_in;
                self.set_nz(self.cpu.regs.a);
            }
            0x6A => {
                let carry_in = u8::from(self.cpu.regs.p.carry);
                self.cpu.regs.p.carry = self.cpu.regs.a & 1 != 0;
                self.cpu.regs.a = (self.cpu.regs.a >> 1) | (carry_in << 7);
                self.set_nz(self.cpu.regs.a);
            }

            // --- branches ---
            0x10 => self.branch(!self.cpu.regs.p.negative),
            0x30 => self.branch(self.cpu.regs.p.negative),
            0x50 => self.branch(!self.cpu.regs.p.overflow),
            0x70 => self.branch(self.cpu.regs.p.overflow),
            0x90 => self.branch(!self.cpu.regs.p.carry),
            0xB0 => self.branch(self.cpu.regs.p.carry),
            0xD0 => self.branch(!self.cpu.regs.p.zero),
            0xF0 => self.branch(self.cpu.regs.p.zero),

            // --- jumps/calls ---
            0x4C => {
                self.cpu.regs.pc = self.addr_absolute();
            }
            0x6C => {
                let ptr = self.fetch_u16();
                let lo = self.read_bus(ptr);
                // Hardware bug: indirect JMP never crosses a page for the
                // high byte fetch.
                let hi_addr = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                let hi = self.read_bus(hi_addr);
                self.cpu.regs.pc = u16::from_le_bytes([lo, hi]);
            }
            0x20 => {
                let target = self.fetch_u16();
                let _ = self.read_bus(0x0100 | u16::from(self.cpu.regs.s));
                let ret = self.cpu.regs.pc.wrapping_sub(1);
                self.push((ret >> 8) as u8);
                self.push(ret as u8);
                self.cpu.regs.pc = target;
            }
            0x60 => {
                let _ = self.read_bus(0x0100 | u16::from(self.cpu.regs.s));
                let lo = self.pull();
                let hi = self.pull();
                let ret = u16::from_le_bytes([lo, hi]);
                let _ = self.read_bus(ret);
                self.cpu.regs.pc = ret.wrapping_add(1);
            }
            0x00 => {
                let _ = self.fetch_u8();
                let pc = self.cpu.regs.pc;
                self.push((pc >> 8) as u8);
                self.push(pc as u8);
                let byte = self.cpu.regs.p.to_byte(true);
                self.push(byte);
                self.cpu.regs.p.interrupt_disable = true;
                self.cpu.regs.pc = self.read_vector(VECTOR_IRQ);
            }
            0x40 => {
                let _ = self.read_bus(0x0100 | u16::from(self.cpu.regs.s));
                let status = self.pull();
                self.cpu.regs.p = crate::cpu::StatusFlags::from_byte(status);
                let lo = self.pull();
                let hi = self.pull();
                self.cpu.regs.pc = u16::from_le_bytes([lo, hi]);
            }

            // --- flags ---
            0x18 => self.cpu.regs.p.carry = false,
            0x38 => self.cpu.regs.p.carry = true,
            0x58 => self.cpu.regs.p.interrupt_disable = false,
            0x78 => self.cpu.regs.p.interrupt_disable = true,
            0xB8 => self.cpu.regs.p.overflow = false,
            0xD8 => self.cpu.regs.p.decimal = false,
            0xF8 => self.cpu.regs.p.decimal = true,

            0x24 => {
                let a = self.addr_zero_page();
                let v = self.read_bus(a);
                self.bit(v);
            }
            0x2C => {
                let a = self.addr_absolute();
                let v = self.read_bus(a);
                self.bit(v);
            }

            0xEA => {}

            // --- undocumented opcodes (§9) ---
            0x4B => {
                // ALR/ASR: AND then LSR on A.
                let v = self.fetch_u8();
                self.cpu.regs.a &= v;
                let c = self.cpu.regs.a & 1 != 0;
                self.cpu.regs.a >>= 1;
                self.cpu.regs.p.carry = c;
                self.set_nz(self.cpu.regs.a);
            }
            0x0B | 0x2B => {
                // ANC: AND then copy bit 7 into carry.
                let v = self.fetch_u8();
                self.cpu.regs.a &= v;
                self.set_nz(self.cpu.regs.a);
                self.cpu.regs.p.carry = self.cpu.regs.a & 0x80 != 0;
            }
            0x6B => {
                // ARR: AND then ROR, with carry/overflow derived from bits 5/6.
                let v = self.fetch_u8();
                let carry_in = u8::from(self.cpu.regs.p.carry);
                self.cpu.regs.a = ((self.cpu.regs.a & v) >> 1) | (carry_in << 7);
                self.set_nz(self.cpu.regs.a);
                self.cpu.regs.p.carry = self.cpu.regs.a & 0x40 != 0;
                self.cpu.regs.p.overflow = (self.cpu.regs.a & 0x40 != 0) ^ (self.cpu.regs.a & 0x20 != 0);
            }
            0xCB => {
                // AXS/SBX: (A & X) - imm into X, no borrow-in.
                let v = self.fetch_u8();
                let t = self.cpu.regs.a & self.cpu.regs.x;
                self.cpu.regs.p.carry = t >= v;
                self.cpu.regs.x = t.wrapping_sub(v);
                self.set_nz(self.cpu.regs.x);
            }
            0xA3 => {
                let a = self.addr_indexed_indirect();
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xA7 => {
                let a = self.addr_zero_page();
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xAF => {
                let a = self.addr_absolute();
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xB3 => {
                let a = self.addr_indirect_indexed(false);
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xB7 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.y);
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0xBF => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                let v = self.read_bus(a);
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.set_nz(v);
            }
            0x83 => {
                let a = self.addr_indexed_indirect();
                self.write_bus(a, self.cpu.regs.a & self.cpu.regs.x);
            }
            0x87 => {
                let a = self.addr_zero_page();
                self.write_bus(a, self.cpu.regs.a & self.cpu.regs.x);
            }
            0x8F => {
                let a = self.addr_absolute();
                self.write_bus(a, self.cpu.regs.a & self.cpu.regs.x);
            }
            0x97 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.y);
                self.write_bus(a, self.cpu.regs.a & self.cpu.regs.x);
            }
            0x03 => {
                let a = self.addr_indexed_indirect();
                self.slo(a);
            }
            0x07 => {
                let a = self.addr_zero_page();
                self.slo(a);
            }
            0x0F => {
                let a = self.addr_absolute();
                self.slo(a);
            }
            0x13 => {
                let a = self.addr_indirect_indexed(true);
                self.slo(a);
            }
            0x17 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.slo(a);
            }
            0x1B => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.slo(a);
            }
            0x1F => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.slo(a);
            }
            0x23 => {
                let a = self.addr_indexed_indirect();
                self.rla(a);
            }
            0x27 => {
                let a = self.addr_zero_page();
                self.rla(a);
            }
            0x2F => {
                let a = self.addr_absolute();
                self.rla(a);
            }
            0x33 => {
                let a = self.addr_indirect_indexed(true);
                self.rla(a);
            }
            0x37 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.rla(a);
            }
            0x3B => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.rla(a);
            }
            0x3F => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.rla(a);
            }
            0x43 => {
                let a = self.addr_indexed_indirect();
                self.sre(a);
            }
            0x47 => {
                let a = self.addr_zero_page();
                self.sre(a);
            }
            0x4F => {
                let a = self.addr_absolute();
                self.sre(a);
            }
            0x53 => {
                let a = self.addr_indirect_indexed(true);
                self.sre(a);
            }
            0x57 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.sre(a);
            }
            0x5B => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.sre(a);
            }
            0x5F => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.sre(a);
            }
            0x63 => {
                let a = self.addr_indexed_indirect();
                self.rra(a);
            }
            0x67 => {
                let a = self.addr_zero_page();
                self.rra(a);
            }
            0x6F => {
                let a = self.addr_absolute();
                self.rra(a);
            }
            0x73 => {
                let a = self.addr_indirect_indexed(true);
                self.rra(a);
            }
            0x77 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.rra(a);
            }
            0x7B => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.rra(a);
            }
            0x7F => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.rra(a);
            }
            0xC3 => {
                let a = self.addr_indexed_indirect();
                self.dcp(a);
            }
            0xC7 => {
                let a = self.addr_zero_page();
                self.dcp(a);
            }
            0xCF => {
                let a = self.addr_absolute();
                self.dcp(a);
            }
            0xD3 => {
                let a = self.addr_indirect_indexed(true);
                self.dcp(a);
            }
            0xD7 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.dcp(a);
            }
            0xDB => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.dcp(a);
            }
            0xDF => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.dcp(a);
            }
            0xE3 => {
                let a = self.addr_indexed_indirect();
                self.isb(a);
            }
            0xE7 => {
                let a = self.addr_zero_page();
                self.isb(a);
            }
            0xEF => {
                let a = self.addr_absolute();
                self.isb(a);
            }
            0xF3 => {
                let a = self.addr_indirect_indexed(true);
                self.isb(a);
            }
            0xF7 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                self.isb(a);
            }
            0xFB => {
                let a = self.addr_absolute_indexed(self.cpu.regs.y, true);
                self.isb(a);
            }
            0xFF => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, true);
                self.isb(a);
            }
            0xBB => {
                // LAS: (mem & S) -> A, X, S.
                let a = self.addr_absolute_indexed(self.cpu.regs.y, false);
                let v = self.read_bus(a) & self.cpu.regs.s;
                self.cpu.regs.a = v;
                self.cpu.regs.x = v;
                self.cpu.regs.s = v;
                self.set_nz(v);
            }
            0x9C => {
                // SYA/SHY
                let base = self.fetch_u16();
                let effective = base.wrapping_add(u16::from(self.cpu.regs.x));
                let value = self.cpu.regs.y & ((base >> 8) as u8).wrapping_add(1);
                self.write_bus(effective, value);
            }
            0x9E => {
                // SXA/SHX
                let base = self.fetch_u16();
                let effective = base.wrapping_add(u16::from(self.cpu.regs.y));
                let value = self.cpu.regs.x & ((base >> 8) as u8).wrapping_add(1);
                self.write_bus(effective, value);
            }
            0x9F | 0x93 => {
                // SHA/AHX
                let addr = if opcode == 0x9F {
                    self.addr_absolute_indexed(self.cpu.regs.y, true)
                } else {
                    self.addr_indirect_indexed(true)
                };
                let value = self.cpu.regs.a & self.cpu.regs.x & ((addr >> 8) as u8).wrapping_add(1);
                self.write_bus(addr, value);
            }
            0x9B => {
                // SHS/TAS
                let base = self.fetch_u16();
                let effective = base.wrapping_add(u16::from(self.cpu.regs.x));
                self.cpu.regs.s = self.cpu.regs.a & self.cpu.regs.x;
                let value = self.cpu.regs.s & ((base >> 8) as u8).wrapping_add(1);
                self.write_bus(effective, value);
            }
            0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => {
                // NOP immediate (2-byte double-NOPs).
                let _ = self.fetch_u8();
            }
            0x04 | 0x44 | 0x64 => {
                let a = self.addr_zero_page();
                let _ = self.read_bus(a);
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                let a = self.addr_zero_page_indexed(self.cpu.regs.x);
                let _ = self.read_bus(a);
            }
            0x0C => {
                let a = self.addr_absolute();
                let _ = self.read_bus(a);
            }
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => {
                let a = self.addr_absolute_indexed(self.cpu.regs.x, false);
                let _ = self.read_bus(a);
            }
            0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA => {
                // single-byte NOPs
            }

            // KIL/JAM opcodes halt the CPU until reset (§4.1 "Failure semantics").
            0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2 | 0xF2 => {
                self.cpu.jammed = true;
                log::debug!("CPU jammed on opcode {opcode:#04x} at PC {:#06x}", self.cpu.regs.pc.wrapping_sub(1));
            }

            _ => {
                log::warn!("unimplemented opcode {opcode:#04x}");
            }
        }
    }

    fn adc(&mut self, value: u8) {
        let a = self.cpu.regs.a;
        let carry = u16::from(self.cpu.regs.p.carry);
        let sum = u16::from(a) + u16::from(value) + carry;
        self.cpu.regs.p.carry = sum > 0xFF;
        let result = sum as u8;
        self.cpu.regs.p.overflow = (!(a ^ value) & (a ^ result) & 0x80) != 0;
        self.cpu.regs.a = result;
        self.set_nz(result);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(!value);
    }

    fn compare(&mut self, reg: u8, value: u8) {
        self.cpu.regs.p.carry = reg >= value;
        let result = reg.wrapping_sub(value);
        self.set_nz(result);
    }

    fn bit(&mut self, value: u8) {
        self.cpu.regs.p.zero = (self.cpu.regs.a & value) == 0;
        self.cpu.regs.p.negative = value & 0x80 != 0;
        self.cpu.regs.p.overflow = value & 0x40 != 0;
    }

    fn slo(&mut self, addr: u16) {
        self.read_modify_write(addr, |s, old| {
            s.cpu.regs.p.carry = old & 0x80 != 0;
            let n = old << 1;
            s.cpu.regs.a |= n;
            s.set_nz(s.cpu.regs.a);
            n
        });
    }

    fn rla(&mut self, addr: u16) {
        self.read_modify_write(addr, |s, old| {
            let carry_in = u8::from(s.cpu.regs.p.carry);
            s.cpu.regs.p.carry = old & 0x80 != 0;
            let n = (old << 1) | carry_in;
            s.cpu.regs.a &= n;
            s.set_nz(s.cpu.regs.a);
            n
        });
    }

    fn sre(&mut self, addr: u16) {
        self.read_modify_write(addr, |s, old| {
            s.cpu.regs.p.carry = old & 1 != 0;
            let n = old >> 1;
            s.cpu.regs.a ^= n;
            s.set_nz(s.cpu.regs.a);
            n
        });
    }

    fn rra(&mut self, addr: u16) {
        let mut new_value = 0;
        self.read_modify_write(addr, |s, old| {
            let carry_in = u8::from(s.cpu.regs.p.carry);
            s.cpu.regs.p.carry = old & 1 != 0;
            new_value = (old >> 1) | (carry_in << 7);
            new_value
        });
        self.adc(new_value);
    }

    fn dcp(&mut self, addr: u16) {
        self.read_modify_write(addr, |s, old| {
            let n = old.wrapping_sub(1);
            s.cpu.regs.p.carry = s.cpu.regs.a >= n;
            let result = s.cpu.regs.a.wrapping_sub(n);
            s.set_nz(result);
            n
        });
    }

    fn isb(&mut self, addr: u16) {
        let mut new_value = 0;
        self.read_modify_write(addr, |_, old| {
            new_value = old.wrapping_add(1);
            new_value
        });
        self.sbc(new_value);
    }

}

impl crate::cpu::CpuState {
    /// Whether any interrupt line is both pending and honored, used by the
    /// outer run loop to decide whether it is safe to stop mid-frame.
    pub fn interrupt_lines_due(&self) -> bool {
        self.interrupts & self.interrupt_mask != 0
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{NesCoreConfig, TimingMode};
    use crate::cpu::Component;
    use crate::expansion::ExpansionAudio;
    use crate::NesCore;

    #[test]
    fn peek_reads_internal_ram_without_advancing_cycles_or_touching_dma() {
        let mut core =
            NesCore::new(TimingMode::Ntsc, ExpansionAudio::None, NesCoreConfig::default(), None).unwrap();
        core.page_banks[0][0x10] = 0x77;

        let cycles_before = core.cpu.cycles;
        let dma_step_before = core.cpu.dma.oam_dma_step;

        assert_eq!(core.peek(0x0010), 0x77);
        assert_eq!(core.cpu.cycles, cycles_before);
        assert_eq!(core.cpu.dma.oam_dma_step, dma_step_before);
    }

    #[test]
    fn oam_dma_odd_start_costs_one_extra_cycle() {
        let mut even =
            NesCore::new(TimingMode::Ntsc, ExpansionAudio::None, NesCoreConfig::default(), None).unwrap();
        let mut odd =
            NesCore::new(TimingMode::Ntsc, ExpansionAudio::None, NesCoreConfig::default(), None).unwrap();

        even.cpu.cycles = 0;
        odd.cpu.cycles = even.cpu.clock_divider;

        even.dispatch_write(Component::OamDma, 0x4014, 0x02);
        odd.dispatch_write(Component::OamDma, 0x4014, 0x02);
        assert!(!even.cpu.dma.oam_dma_odd_start);
        assert!(odd.cpu.dma.oam_dma_odd_start);

        let even_start = even.cpu.cycles;
        while even.cpu.dma.oam_dma_step < 256 {
            even.service_oam_dma_byte();
        }
        let even_total = even.cpu.cycles - even_start;

        let odd_start = odd.cpu.cycles;
        while odd.cpu.dma.oam_dma_step < 256 {
            odd.service_oam_dma_byte();
        }
        let odd_total = odd.cpu.cycles - odd_start;

        assert_eq!(odd_total, even_total + even.cpu.clock_divider);
    }
}
