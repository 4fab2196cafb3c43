use pretty_assertions::assert_eq;

use firmware::RomSet;
use memory::otfdec::OtfDec;
use pocket_interrupts::{exception, EXC_RETURN_THREAD_MSP};
use pocket_machine::devices::Button;
use pocket_machine::{Machine, MachineConfig, RunExit};

const FLASH_BASE: u32 = 0x0800_0000;
const CODE_BASE: u32 = FLASH_BASE + 8;
const INITIAL_SP: u32 = 0x2001_8000;
const HANDLER_OFFSET: usize = 0x100;

/// Build an internal-flash image: vector table (SP, reset), thread code at
/// offset 8, optional handler code at offset 0x100.
fn flash_image(code: &[u16], handler: &[u16]) -> Vec<u8> {
    let mut image = vec![0xFFu8; 0x8000];
    image[0..4].copy_from_slice(&INITIAL_SP.to_le_bytes());
    image[4..8].copy_from_slice(&(CODE_BASE | 1).to_le_bytes());
    let mut at = 8;
    for hw in code {
        image[at..at + 2].copy_from_slice(&hw.to_le_bytes());
        at += 2;
    }
    let mut at = HANDLER_OFFSET;
    for hw in handler {
        image[at..at + 2].copy_from_slice(&hw.to_le_bytes());
        at += 2;
    }
    image
}

fn set_vector(image: &mut [u8], number: u16, target: u32) {
    let at = 4 * number as usize;
    image[at..at + 4].copy_from_slice(&(target | 1).to_le_bytes());
}

fn boot_machine(image: Vec<u8>) -> Machine {
    let set = RomSet {
        internal_flash: image,
        external_flash: None,
        itcm: None,
        key_info: None,
    };
    let mut machine = Machine::new(MachineConfig::default());
    machine.install_rom_set(&set);
    machine.reset().unwrap();
    machine
}

fn run_to_bkpt(machine: &mut Machine) -> u8 {
    for _ in 0..100 {
        match machine.run_slice(100_000) {
            RunExit::Bkpt { comment, .. } => return comment,
            RunExit::Completed { .. } | RunExit::Halted { .. } => {}
            other => panic!("unexpected exit: {other:?}"),
        }
    }
    panic!(
        "program never reached BKPT; pc={:#010x}",
        machine.cpu.state.pc()
    );
}

#[test]
fn scenario_movs_adds_subs() {
    // MOVS R0, #1; ADDS R0, #2; SUBS R0, #1; BKPT, entered through the
    // reset vector at 0x08000008 with the stack in DTCM.
    let mut machine = boot_machine(flash_image(&[0x2001, 0x3002, 0x3801, 0xBE00], &[]));
    assert_eq!(machine.cpu.state.sp(), INITIAL_SP);
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 2);
}

#[test]
fn scenario_branch_over() {
    // B .+4 skips the first MOVS; the second one commits.
    let mut machine = boot_machine(flash_image(&[0xE000, 0x2105, 0x2107, 0xBE00], &[]));
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(1), 7);
}

#[test]
fn scenario_ldr_literal() {
    // LDR R2, [PC, #0]; BKPT; .word 0xDEADBEEF at (pc+4) & !3.
    let mut machine = boot_machine(flash_image(&[0x4A00, 0xBE00, 0xBEEF, 0xDEAD], &[]));
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(2), 0xDEAD_BEEF);
}

#[test]
fn scenario_thumb2_modified_immediate() {
    // MOV.W R0, #0x00FF00FF leaves C unchanged.
    let mut machine = boot_machine(flash_image(&[0xF04F, 0x10FF, 0xBE00], &[]));
    machine.cpu.state.set_c(true);
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 0x00FF_00FF);
    assert!(machine.cpu.state.c());
}

#[test]
fn scenario_it_block_predication() {
    // CMP R0, #1 clears Z; ITE EQ commits only the else slot.
    let mut machine = boot_machine(flash_image(&[0x2801, 0xBF0C, 0x2001, 0x2002, 0xBE00], &[]));
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 2);
}

#[test]
fn scenario_exception_round_trip() {
    // Thread: NOPs. Handler at 0x08000100: MOVS R3, #0x77; BX LR.
    let mut image = flash_image(&[0xBF00, 0xBF00, 0xBF00, 0xBF00, 0xBE00], &[0x2377, 0x4770]);
    let irq = exception::from_irq(0);
    set_vector(&mut image, irq, FLASH_BASE + HANDLER_OFFSET as u32);
    let mut machine = boot_machine(image);

    machine.cpu.exc.set_enabled(irq, true);
    machine.cpu.exc.set_priority(irq, 0x80);

    // Run one instruction, then pend the interrupt.
    machine.run_slice(1);
    let saved: Vec<u32> = (0..13).map(|i| machine.cpu.state.reg(i)).collect();
    let saved_sp = machine.cpu.state.sp();
    let saved_xpsr = machine.cpu.state.xpsr();
    machine.cpu.exc.set_pending(irq);

    // Entry happens before the next fetch: one step runs the handler's
    // first instruction.
    machine.run_slice(1);
    assert_eq!(machine.cpu.state.ipsr(), irq);
    assert_eq!(machine.cpu.state.lr(), EXC_RETURN_THREAD_MSP);
    assert_eq!(machine.cpu.state.sp(), saved_sp - 32);
    assert_eq!(machine.cpu.state.reg(3), 0x77);

    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.ipsr(), 0);
    assert_eq!(machine.cpu.state.sp(), saved_sp);
    assert_eq!(machine.cpu.state.xpsr(), saved_xpsr);
    for i in 0..4 {
        assert_eq!(machine.cpu.state.reg(i), saved[i as usize], "R{i}");
    }
    assert_eq!(machine.cpu.state.reg(12), saved[12]);
}

#[test]
fn boot_alias_supplies_vectors_then_itcm_takes_over() {
    let image = flash_image(&[0x2001, 0xBE00], &[]);
    // An ITCM snapshot whose first word differs from the vector table.
    let mut itcm = vec![0u8; 0x100];
    itcm[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    let set = RomSet {
        internal_flash: image,
        external_flash: None,
        itcm: Some(itcm),
        key_info: None,
    };
    let mut machine = Machine::new(MachineConfig::default());
    machine.install_rom_set(&set);
    machine.reset().unwrap();

    // Reset consumed the flash-alias vectors...
    assert_eq!(machine.cpu.state.sp(), INITIAL_SP);
    assert_eq!(machine.cpu.state.pc(), CODE_BASE);
    // ...and the override is live afterwards.
    assert_eq!(
        machine.cpu.read_mem_u32(&mut machine.bus, 0).unwrap(),
        0x1234_5678
    );
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 1);
}

#[test]
fn external_flash_decrypts_on_the_fly() {
    // MOVW R1, #0; MOVT R1, #0x9000; LDR R0, [R1]; BKPT
    let image = flash_image(
        &[0xF240, 0x0100, 0xF2C9, 0x0100, 0x6808, 0xBE00],
        &[],
    );

    let key = [0x0101_0101u32, 0x0202_0202, 0x0303_0303, 0x0404_0404];
    let nonce = [0xAABB_CCDDu32, 0x1122_3344];
    // Encrypt the plaintext with the same keystream (CTR is symmetric).
    let forward = OtfDec::new(&key, &nonce, 7, 1, 0x9000_0000, 0x900F_DFFF);
    let mut cipher = 0xCAFE_BABEu32.to_le_bytes();
    forward.decrypt(0x9000_0000, &mut cipher);

    let key_info = firmware::KeyInfo::parse(&format!(
        r#"{{
            "OtfDecKey": ["{:#x}", "{:#x}", "{:#x}", "{:#x}"],
            "OtfDecNonce": ["{:#x}", "{:#x}"],
            "OtfDecVersion": 7,
            "OtfDecRegion": 1,
            "OtfDecStart": "0x90000000",
            "OtfDecEnd": "0x900FDFFF"
        }}"#,
        key[0], key[1], key[2], key[3], nonce[0], nonce[1]
    ))
    .unwrap();

    let set = RomSet {
        internal_flash: image,
        external_flash: Some(firmware::ExternalImage {
            data: cipher.to_vec(),
            decrypted: false,
        }),
        itcm: None,
        key_info: Some(key_info),
    };
    let mut machine = Machine::new(MachineConfig::default());
    machine.install_rom_set(&set);
    machine.reset().unwrap();
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 0xCAFE_BABE);
}

#[test]
fn breakpoints_stop_the_slice() {
    let mut machine = boot_machine(flash_image(&[0x2001, 0x3002, 0x3801, 0xBE00], &[]));
    machine.add_breakpoint(CODE_BASE + 4);
    match machine.run_slice(1_000) {
        RunExit::Breakpoint { pc } => assert_eq!(pc, CODE_BASE + 4),
        other => panic!("unexpected exit: {other:?}"),
    }
    // The breakpointed instruction has not executed yet.
    assert_eq!(machine.cpu.state.reg(0), 3);
    machine.remove_breakpoint(CODE_BASE + 4);
    run_to_bkpt(&mut machine);
    assert_eq!(machine.cpu.state.reg(0), 2);
}

#[test]
fn wfi_reports_halted_and_wakes_on_interrupt() {
    let mut image = flash_image(&[0xBF30, 0xBE00], &[0x4770]);
    let irq = exception::from_irq(2);
    set_vector(&mut image, irq, FLASH_BASE + HANDLER_OFFSET as u32);
    let mut machine = boot_machine(image);
    machine.cpu.exc.set_enabled(irq, true);
    machine.cpu.exc.set_priority(irq, 0x40);

    match machine.run_slice(50) {
        RunExit::Halted { cycles } => assert!(cycles >= 1),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(machine.cpu.state.halted);

    machine.cpu.exc.set_pending(irq);
    let comment = run_to_bkpt(&mut machine);
    assert_eq!(comment, 0);
    assert!(!machine.cpu.state.halted);
}

#[test]
fn systick_wakes_wfi_through_its_vector() {
    // Thread: WFI; BKPT #1. SysTick handler: BKPT #2.
    let mut image = flash_image(&[0xBF30, 0xBE01], &[0xBE02]);
    set_vector(&mut image, exception::SYSTICK, FLASH_BASE + HANDLER_OFFSET as u32);
    let mut machine = boot_machine(image);

    // LOAD=100, clear, enable with interrupt.
    machine
        .cpu
        .write_mem_u32(&mut machine.bus, 0xE000_E014, 100)
        .unwrap();
    machine
        .cpu
        .write_mem_u32(&mut machine.bus, 0xE000_E018, 0)
        .unwrap();
    machine
        .cpu
        .write_mem_u32(&mut machine.bus, 0xE000_E010, 0x3)
        .unwrap();

    let comment = run_to_bkpt(&mut machine);
    assert_eq!(comment, 2, "the SysTick handler must run first");
    assert_eq!(machine.cpu.state.ipsr(), exception::SYSTICK);
}

#[test]
fn fault_limit_halts_a_runaway_machine() {
    // BX into unmapped space: every fetch faults, the host skips a
    // halfword each time and eventually gives up.
    let mut machine = boot_machine(flash_image(
        &[
            0xF240, 0x0001, // MOVW R0, #1
            0xF2C7, 0x0000, // MOVT R0, #0x7000
            0x4700, // BX R0
        ],
        &[],
    ));
    match machine.run_slice(1_000_000) {
        RunExit::FaultLimit { pc } => assert!(pc >= 0x7000_0000),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(machine.cpu.state.halted);
}

#[test]
fn buttons_read_back_through_gpio_idr() {
    // MOVW R1, #0x0C00; MOVT R1, #0x5802 (GPIOD); LDR R0, [R1, #0x10]; BKPT
    let mut machine = boot_machine(flash_image(
        &[0xF640, 0x4100, 0xF6C5, 0x0102, 0x6908, 0xBE00],
        &[],
    ));
    machine.set_button(Button::A, true);
    run_to_bkpt(&mut machine);
    // PD9 is A, active low; everything else idles high.
    assert_eq!(machine.cpu.state.reg(0) & 0xFFFF, 0xFFFF & !(1 << 9));
}

#[test]
fn frame_budget_accounts_cycles() {
    // A tight loop: B .-4 back onto itself? Use NOP; B .-6.
    let mut machine = boot_machine(flash_image(&[0xBF00, 0xE7FD], &[]));
    match machine.run_slice(500) {
        RunExit::Completed { cycles } => assert!(cycles >= 500),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(machine.cycles() >= 500);
}
