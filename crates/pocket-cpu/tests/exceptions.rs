use pocket_cpu::{Cpu, FlatTestBus, StepExit};
use pocket_interrupts::{exception, EXC_RETURN_THREAD_MSP};

const CODE_BASE: u32 = 0x1000;
const HANDLER_BASE: u32 = 0x2000;
const STACK_TOP: u32 = 0x8000;

fn boot(code: &[u16], handler: &[u16]) -> (Cpu, FlatTestBus) {
    let mut bus = FlatTestBus::new(0x40000);
    bus.load(0, &STACK_TOP.to_le_bytes());
    bus.load(4, &(CODE_BASE | 1).to_le_bytes());
    let mut bytes = Vec::new();
    for hw in code {
        bytes.extend_from_slice(&hw.to_le_bytes());
    }
    bus.load(CODE_BASE, &bytes);
    let mut bytes = Vec::new();
    for hw in handler {
        bytes.extend_from_slice(&hw.to_le_bytes());
    }
    bus.load(HANDLER_BASE, &bytes);
    let mut cpu = Cpu::new();
    cpu.reset(&mut bus).unwrap();
    (cpu, bus)
}

fn set_vector(bus: &mut FlatTestBus, number: u16, target: u32) {
    bus.load(4 * number as u32, &(target | 1).to_le_bytes());
}

#[test]
fn irq_entry_stacks_frame_and_returns_bit_identical() {
    // Thread code: NOPs forever. Handler: MOVS R3, #0x77; BX LR.
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xBF00, 0xBF00, 0xBF00], &[0x2377, 0x4770]);
    let irq = exception::from_irq(5);
    set_vector(&mut bus, irq, HANDLER_BASE);

    // One NOP to give the registers realistic values first.
    for i in 0..13 {
        cpu.state.set_reg(i, 0xA000_0000 | i as u32);
    }
    cpu.state.set_lr(0x0000_1235);
    cpu.state.set_c(true);
    cpu.state.set_n(true);
    cpu.step(&mut bus).unwrap();

    let saved: Vec<u32> = (0..16).map(|i| cpu.state.reg(i)).collect();
    let saved_xpsr = cpu.state.xpsr();
    let saved_sp = cpu.state.sp();

    cpu.exc.set_enabled(irq, true);
    cpu.exc.set_priority(irq, 0x80);
    cpu.exc.set_pending(irq);

    // Entry happens before the next fetch; this step runs the handler's
    // first instruction.
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.state.ipsr(), irq);
    assert_eq!(cpu.state.lr(), EXC_RETURN_THREAD_MSP);
    assert_eq!(cpu.state.reg(3), 0x77);
    // STACK_TOP is 8-aligned: exactly 32 bytes of frame, no realignment.
    assert_eq!(cpu.state.sp(), saved_sp - 32);
    let frame = cpu.state.sp();
    assert_eq!(cpu.read_mem_u32(&mut bus, frame).unwrap(), saved[0]);
    assert_eq!(cpu.read_mem_u32(&mut bus, frame + 16).unwrap(), saved[12]);
    assert_eq!(cpu.read_mem_u32(&mut bus, frame + 20).unwrap(), 0x0000_1235);
    assert_eq!(
        cpu.read_mem_u32(&mut bus, frame + 24).unwrap(),
        CODE_BASE + 2
    );
    assert_eq!(cpu.read_mem_u32(&mut bus, frame + 28).unwrap(), saved_xpsr);
    assert!(cpu.exc.is_active(irq));

    // BX LR performs the EXC_RETURN unwinding.
    while cpu.state.ipsr() != 0 {
        cpu.step(&mut bus).unwrap();
    }
    for i in 0..4 {
        assert_eq!(cpu.state.reg(i), saved[i as usize], "R{i}");
    }
    assert_eq!(cpu.state.reg(12), saved[12]);
    assert_eq!(cpu.state.lr(), 0x0000_1235);
    assert_eq!(cpu.state.sp(), saved_sp);
    assert_eq!(cpu.state.xpsr(), saved_xpsr);
    assert_eq!(cpu.state.pc(), CODE_BASE + 2);
    assert!(!cpu.exc.is_active(irq));
}

#[test]
fn entry_realigns_sp_and_records_bit_9() {
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xBF00], &[0x4770]);
    let irq = exception::from_irq(0);
    set_vector(&mut bus, irq, HANDLER_BASE);

    // Force a misaligned (4 mod 8) stack pointer.
    cpu.state.set_msp(STACK_TOP - 4);
    cpu.exc.set_enabled(irq, true);
    cpu.exc.set_priority(irq, 0x40);
    cpu.exc.set_pending(irq);
    cpu.step(&mut bus).unwrap();

    // 4 bytes of padding plus the 32-byte frame.
    let frame = STACK_TOP - 4 - 4 - 32;
    let stacked_xpsr = cpu.read_mem_u32(&mut bus, frame + 28).unwrap();
    assert_ne!(stacked_xpsr & (1 << 9), 0);

    while cpu.state.ipsr() != 0 {
        cpu.step(&mut bus).unwrap();
    }
    assert_eq!(cpu.state.msp(), STACK_TOP - 4);
    // The realignment bit never leaks into the live xPSR.
    assert_eq!(cpu.state.xpsr() & (1 << 9), 0);
}

#[test]
fn svc_pends_and_enters_before_next_fetch() {
    // SVC #7; MOVS R1, #1; BKPT -- handler: MOVS R0, #5; BX LR
    let (mut cpu, mut bus) = boot(&[0xDF07, 0x2101, 0xBE00], &[0x2005, 0x4770]);
    set_vector(&mut bus, exception::SVCALL, HANDLER_BASE);

    // SVC executes and pends SVCall.
    cpu.step(&mut bus).unwrap();
    assert!(cpu.exc.is_pending(exception::SVCALL));

    // The next step enters the handler before fetching MOVS R1.
    cpu.step(&mut bus).unwrap();
    assert!(cpu.exc.is_active(exception::SVCALL) || cpu.state.reg(0) == 5);

    for _ in 0..10 {
        if let StepExit::Bkpt(_) = cpu.step(&mut bus).unwrap() {
            break;
        }
    }
    assert_eq!(cpu.state.reg(0), 5);
    assert_eq!(cpu.state.reg(1), 1);
    assert_eq!(cpu.state.ipsr(), 0);
}

#[test]
fn higher_priority_irq_preempts_handler() {
    // Low-priority handler loops on NOPs; high-priority handler hits BKPT.
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xBF00], &[0xBF00, 0xBF00, 0xBF00, 0xE7FC]);
    let low = exception::from_irq(1);
    let high = exception::from_irq(2);
    set_vector(&mut bus, low, HANDLER_BASE);
    let high_handler = HANDLER_BASE + 0x100;
    bus.load(high_handler, &0xBE00u16.to_le_bytes()); // BKPT
    set_vector(&mut bus, high, high_handler);

    cpu.exc.set_enabled(low, true);
    cpu.exc.set_priority(low, 0x80);
    cpu.exc.set_enabled(high, true);
    cpu.exc.set_priority(high, 0x20);

    cpu.exc.set_pending(low);
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.state.ipsr(), low);

    cpu.exc.set_pending(high);
    let exit = cpu.step(&mut bus).unwrap();
    assert_eq!(exit, StepExit::Bkpt(0));
    assert_eq!(cpu.state.ipsr(), high);
    assert!(cpu.exc.is_active(low));
    assert!(cpu.exc.is_active(high));
}

#[test]
fn primask_defers_interrupt_until_cleared() {
    // CPSID i; NOP; NOP; CPSIE i; NOP...
    let (mut cpu, mut bus) = boot(&[0xB672, 0xBF00, 0xBF00, 0xB662, 0xBF00, 0xBF00], &[0xBE00]);
    let irq = exception::from_irq(3);
    set_vector(&mut bus, irq, HANDLER_BASE);
    cpu.exc.set_enabled(irq, true);
    cpu.exc.set_priority(irq, 0x40);

    cpu.step(&mut bus).unwrap(); // CPSID
    cpu.exc.set_pending(irq);
    cpu.step(&mut bus).unwrap(); // NOP, no entry
    cpu.step(&mut bus).unwrap(); // NOP, no entry
    assert_eq!(cpu.state.ipsr(), 0);
    assert!(cpu.exc.is_pending(irq));

    cpu.step(&mut bus).unwrap(); // CPSIE
    let exit = cpu.step(&mut bus).unwrap(); // entry + handler BKPT
    assert_eq!(exit, StepExit::Bkpt(0));
    assert_eq!(cpu.state.ipsr(), irq);
}

#[test]
fn basepri_gates_lower_priority_only() {
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xBF00, 0xBF00], &[0xBE00]);
    let weak = exception::from_irq(4);
    let strong = exception::from_irq(5);
    set_vector(&mut bus, weak, HANDLER_BASE);
    set_vector(&mut bus, strong, HANDLER_BASE);
    cpu.exc.set_enabled(weak, true);
    cpu.exc.set_priority(weak, 0x80);
    cpu.exc.set_enabled(strong, true);
    cpu.exc.set_priority(strong, 0x20);
    cpu.state.basepri = 0x40;

    cpu.exc.set_pending(weak);
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.state.ipsr(), 0, "BASEPRI must hold off priority 0x80");

    cpu.exc.set_pending(strong);
    let exit = cpu.step(&mut bus).unwrap();
    assert_eq!(exit, StepExit::Bkpt(0));
    assert_eq!(cpu.state.ipsr(), strong);
}

#[test]
fn nvic_mmio_round_trip_through_core() {
    let (mut cpu, mut bus) = boot(&[0xBF00], &[0x4770]);
    // ISER0: enable IRQ5.
    cpu.write_mem_u32(&mut bus, 0xE000_E100, 1 << 5).unwrap();
    assert!(cpu.exc.is_enabled(exception::from_irq(5)));
    // IPR5 is the byte at 0xE000_E405: priorities keep their top four bits.
    cpu.write_mem_u8(&mut bus, 0xE000_E405, 0xAB).unwrap();
    assert_eq!(
        cpu.read_mem_u8(&mut bus, 0xE000_E405).unwrap(),
        0xA0
    );
    assert_eq!(cpu.exc.priority(exception::from_irq(5)), 0xA0);
    // ISPR0 pends it; ICSR reports it as VECTPENDING.
    cpu.write_mem_u32(&mut bus, 0xE000_E200, 1 << 5).unwrap();
    let icsr = cpu.read_mem_u32(&mut bus, 0xE000_ED04).unwrap();
    assert_eq!((icsr >> 12) & 0x1FF, exception::from_irq(5) as u32);
}

#[test]
fn vtor_redirects_vector_fetch() {
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xBF00], &[0xBE00]);
    let irq = exception::from_irq(0);
    // Vector table relocated to 0x4000.
    cpu.write_mem_u32(&mut bus, 0xE000_ED08, 0x4000).unwrap();
    bus.load(0x4000 + 4 * irq as u32, &(HANDLER_BASE | 1).to_le_bytes());
    cpu.exc.set_enabled(irq, true);
    cpu.exc.set_priority(irq, 0x40);
    cpu.exc.set_pending(irq);
    let exit = cpu.step(&mut bus).unwrap();
    assert_eq!(exit, StepExit::Bkpt(0));
}

#[test]
fn systick_fires_through_mmio_programming() {
    // Thread: NOP loop. SysTick handler: BKPT.
    let (mut cpu, mut bus) = boot(&[0xBF00, 0xE7FD], &[0xBE00]);
    set_vector(&mut bus, exception::SYSTICK, HANDLER_BASE);
    // LOAD = 20 cycles, enable with interrupt.
    cpu.write_mem_u32(&mut bus, 0xE000_E014, 20).unwrap();
    cpu.write_mem_u32(&mut bus, 0xE000_E018, 0).unwrap();
    cpu.write_mem_u32(&mut bus, 0xE000_E010, 0x3).unwrap();

    for _ in 0..200 {
        if let StepExit::Bkpt(_) = cpu.step(&mut bus).unwrap() {
            assert_eq!(cpu.state.ipsr(), exception::SYSTICK);
            return;
        }
    }
    panic!("SysTick interrupt never fired");
}

#[test]
fn exception_entry_clears_exclusive_monitor() {
    // LDREX R0, [R1]; NOP; STREX R2, R0, [R1] with an interrupt in between.
    let (mut cpu, mut bus) = boot(
        &[
            0xF243, 0x0100, // MOVW R1, #0x3000
            0xE851, 0x0F00, // LDREX R0, [R1]
            0xBF00, // NOP (interrupt lands here)
            0xE841, 0x0200, // STREX R2, R0, [R1]
            0xBE00,
        ],
        &[0x4770], // BX LR
    );
    let irq = exception::from_irq(9);
    set_vector(&mut bus, irq, HANDLER_BASE);
    cpu.exc.set_enabled(irq, true);
    cpu.exc.set_priority(irq, 0x40);

    cpu.step(&mut bus).unwrap(); // MOVW
    cpu.step(&mut bus).unwrap(); // LDREX
    assert!(cpu.state.exclusive.is_some());
    cpu.exc.set_pending(irq);
    cpu.step(&mut bus).unwrap(); // entry + BX LR
    while cpu.state.ipsr() != 0 {
        cpu.step(&mut bus).unwrap();
    }
    assert!(cpu.state.exclusive.is_none());
    for _ in 0..10 {
        if let StepExit::Bkpt(_) = cpu.step(&mut bus).unwrap() {
            break;
        }
    }
    assert_eq!(cpu.state.reg(2), 1, "STREX must fail after an exception");
}
