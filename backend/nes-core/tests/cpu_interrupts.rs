//! Interrupt-line bookkeeping at the `CpuState` level: masking while the
//! I flag is set, NMI's immunity to that mask, and the per-line schedule
//! bitmask staying independent across lines.

use test_log::test;

use nes_core::cpu::{irq_mask, nmi_mask, CpuState, IrqLine};

fn cpu() -> CpuState {
    CpuState::new(12)
}

#[test]
fn due_interrupt_is_immediately_pending_when_scheduled_at_or_before_the_current_cycle() {
    let mut cpu = cpu();
    cpu.cycles = 100;

    cpu.interrupt_schedule(IrqLine::ApuFrame, 100);

    assert_eq!(cpu.interrupts & irq_mask(IrqLine::ApuFrame), irq_mask(IrqLine::ApuFrame));
    assert_eq!(cpu.interrupt_times[IrqLine::ApuFrame as usize], 100);
}

#[test]
fn interrupt_scheduled_in_the_future_records_its_deadline_without_setting_the_pending_bit() {
    let mut cpu = cpu();
    cpu.cycles = 100;

    cpu.interrupt_schedule(IrqLine::ApuDmc, 200);

    assert_eq!(cpu.interrupts & irq_mask(IrqLine::ApuDmc), 0);
    assert_eq!(cpu.interrupt_times[IrqLine::ApuDmc as usize], 200);
}

#[test]
fn interrupt_disable_flag_masks_ordinary_irq_lines_but_not_nmi() {
    let mut cpu = cpu();
    cpu.regs.p.interrupt_disable = true;
    cpu.update_interrupt_mask();

    assert_eq!(cpu.interrupt_mask, nmi_mask() | irq_mask(IrqLine::Reset));

    cpu.interrupt_schedule(IrqLine::ApuFrame, cpu.cycles);
    cpu.interrupt_schedule(IrqLine::Nmi, cpu.cycles);

    assert!(!cpu.interrupt_lines_due(), "an ordinary IRQ line must stay masked while I is set");

    cpu.interrupt_cancel(IrqLine::ApuFrame);
    cpu.interrupt_schedule(IrqLine::Nmi, cpu.cycles);
    assert!(cpu.interrupt_lines_due(), "NMI must pass the mask even with I set");
}

#[test]
fn clearing_the_interrupt_disable_flag_unmasks_every_line() {
    let mut cpu = cpu();
    cpu.regs.p.interrupt_disable = true;
    cpu.update_interrupt_mask();
    cpu.interrupt_schedule(IrqLine::ApuFrame, cpu.cycles);
    assert!(!cpu.interrupt_lines_due());

    cpu.regs.p.interrupt_disable = false;
    cpu.update_interrupt_mask();
    assert!(cpu.interrupt_lines_due(), "ApuFrame must become visible once I is cleared");
}

#[test]
fn acking_one_line_leaves_other_pending_lines_untouched() {
    let mut cpu = cpu();
    cpu.interrupt_schedule(IrqLine::ApuFrame, cpu.cycles);
    cpu.interrupt_schedule(IrqLine::ApuDmc, cpu.cycles);

    let was_pending = cpu.interrupt_ack(IrqLine::ApuFrame);

    assert!(was_pending);
    assert_eq!(cpu.interrupts & irq_mask(IrqLine::ApuFrame), 0);
    assert_eq!(cpu.interrupts & irq_mask(IrqLine::ApuDmc), irq_mask(IrqLine::ApuDmc));
}

#[test]
fn calculate_step_cycles_stops_at_the_earliest_of_frame_end_dma_and_pending_deadlines() {
    let mut cpu = cpu();
    cpu.interrupt_schedule(IrqLine::ApuFrame, 500);
    cpu.board_run_schedule(300);
    cpu.set_dmc_dma_timestamp(700, 0xC000, false);

    assert_eq!(cpu.calculate_step_cycles(10_000), 300, "board-run deadline is the nearest of the four");
}
