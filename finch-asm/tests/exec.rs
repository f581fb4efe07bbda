//! Assemble-and-execute tests: the assembler's output must run correctly on
//! the VM, bit for bit.

use finch_asm::assemble;
use finch_vm::{flag, Machine, Ram, FRAMEBUFFER_SIZE, STACK_TOP};

fn build(src: &str) -> Vec<u8> {
    match assemble(src) {
        Ok(image) => image,
        Err(errs) => panic!("assembly failed: {errs:?}"),
    }
}

fn console_str(vm: &Machine) -> String {
    let n = usize::from(vm.console_len());
    String::from_utf8_lossy(&vm.console_bytes()[..n]).into_owned()
}

#[test]
fn fill_screen() {
    let image = build(
        "MOVI R0, 0x4000\n\
         MOVI R1, 0xE0\n\
         MOVI R2, 16384\n\
         MEMSET\n\
         DISPLAY\n\
         HALT\n",
    );
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);

    // first step stops at the display request
    vm.step(1_000_000);
    assert!(vm.display_requested());
    assert!(!vm.is_halted());
    assert!(vm.consume_display());
    vm.step(1_000_000);
    assert!(vm.is_halted());

    assert!(vm.framebuffer().iter().all(|&b| b == 0xE0));
    assert_eq!(vm.framebuffer().len(), FRAMEBUFFER_SIZE);
    assert_eq!(vm.register(0), 0x8000);
    assert_eq!(vm.register(1), 0xE0);
    assert_eq!(vm.register(2), 0);
    let expected = 3 + 3 + 3 + (5 + 16384) + 1000 + 1;
    assert_eq!(vm.cycles(), expected);
}

#[test]
fn call_ret_round_trip() {
    let image = build("CALL sub\nHALT\nsub: NOP\nRET\n");
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(1_000);
    assert!(vm.is_halted());
    // PC rests one past the HALT opcode at offset 3
    assert_eq!(vm.pc(), 4);
    assert_eq!(vm.sp(), STACK_TOP);
}

#[test]
fn forward_jump_image_is_exact() {
    let image = build("JMP end\nNOP\nend: HALT\n");
    assert_eq!(image, [0x50, 0x04, 0x00, 0x00, 0x01]);

    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(1_000);
    assert!(vm.is_halted());
    // JMP(3) + HALT(1); the NOP is skipped
    assert_eq!(vm.cycles(), 4);
}

#[test]
fn puts_walks_a_db_string() {
    let image = build(
        "MOVI R0, msg\n\
         PUTS R0\n\
         HALT\n\
         msg: .db \"Hello, finch!\", 10, 0\n",
    );
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(10_000);
    assert!(vm.consume_console_update());
    assert_eq!(console_str(&vm), "Hello, finch!\n");
}

#[test]
fn puti_putx_formatting() {
    let image = build(
        "MOVI R0, 0\n\
         PUTI R0\n\
         MOVI R0, 65535\n\
         PUTI R0\n\
         MOVI R0, 0xABCD\n\
         PUTX R0\n\
         HALT\n",
    );
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(10_000);
    assert_eq!(console_str(&vm), "0655350xABCD");
}

#[test]
fn flags_after_subtraction() {
    let image = build("MOVI R0, 5\nMOVI R1, 5\nSUB R0, R1\nHALT\n");
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(1_000);
    assert_eq!(vm.register(0), 0);
    assert_eq!(vm.flags(), flag::Z);

    let image = build("MOVI R0, 0\nMOVI R1, 1\nSUB R0, R1\nHALT\n");
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(1_000);
    assert_eq!(vm.register(0), 0xFFFF);
    assert_eq!(vm.flags(), flag::C | flag::N);
}

#[test]
fn guest_reads_the_keyboard_latch() {
    let image = build(
        ".equ KEY_CODE, 0xFFF4\n\
         .equ KEY_STATE, 0xFFF5\n\
         MOVI R0, KEY_CODE\n\
         LOADB R1, [R0]\n\
         MOVI R0, KEY_STATE\n\
         LOADB R2, [R0]\n\
         HALT\n",
    );
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.set_key(0x41, true);
    vm.set_key(0, false);
    vm.step(1_000);
    assert_eq!(vm.register(1), 0x41);
    assert_eq!(vm.register(2), 0);
}

#[test]
fn guest_writes_the_countdown_timer() {
    let image = build(
        ".equ COUNTDOWN, 0xFFF2\n\
         MOVI R0, COUNTDOWN\n\
         MOVI R1, 100\n\
         STORE [R0], R1\n\
         HALT\n",
    );
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    vm.step(1_000);
    vm.tick_timers(30);
    assert_eq!(vm.mem().read16(0xFFF2), 70);
    assert_eq!(vm.mem().read16(0xFFF0), 30);
}

#[test]
fn demos_assemble() {
    for (name, src) in [
        ("fill_screen", include_str!("../../demos/fill_screen.asm")),
        ("gradient", include_str!("../../demos/gradient.asm")),
        ("color_cycle", include_str!("../../demos/color_cycle.asm")),
        ("keyboard_test", include_str!("../../demos/keyboard_test.asm")),
        ("moving_pixel", include_str!("../../demos/moving_pixel.asm")),
        ("hello", include_str!("../../demos/hello.asm")),
    ] {
        if let Err(errs) = assemble(src) {
            panic!("{name}.asm failed to assemble: {errs:?}");
        }
    }
}

#[test]
fn gradient_demo_runs() {
    let image = build(include_str!("../../demos/gradient.asm"));
    let mut ram = Ram::new();
    let mut vm = Machine::new(&mut ram);
    vm.load_program(&image);
    while !vm.display_requested() && !vm.is_halted() {
        vm.step(100_000);
    }
    // row-major gradient: row y is filled with value y
    let fb = vm.framebuffer();
    assert_eq!(fb[0], 0);
    assert_eq!(fb[127 * 128], 127);
}
