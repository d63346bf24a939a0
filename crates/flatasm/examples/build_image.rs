//! Kernel image example: compose a tiny multiboot kernel and write it out.
//!
//! The kernel clears the VGA text screen, prints a banner, counts timer
//! ticks in a static field, and halts.
//!
//! Run with: `cargo run --example build_image -- kernel.bin`

use flatasm::{
    narrow, Assembler, FieldType, ImageConfig, InstructionStream, MemoryOperand, MethodCode,
    OperandSize, Program, Register, StaticField,
};

const VGA: i32 = 0xB8000;

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("kernel.bin"));

    let mut asm = Assembler::new();
    let mut program = Program::new();

    // --- kernel_main: print the banner ---
    asm.begin_method("kernel_main");
    let banner = asm.intern_string("flatasm kernel up");
    let src = asm.registers_mut().acquire().unwrap();
    let dst = asm.registers_mut().acquire().unwrap();
    let tmp = asm.registers_mut().acquire().unwrap();
    let ch = narrow(tmp.register(), OperandSize::Byte).unwrap();
    let mut body = InstructionStream::new();
    body.call("clear_screen")
        .mov(src.register(), banner.as_str())
        .mov(dst.register(), VGA)
        .label("print_loop")
        .mov(ch, MemoryOperand::byte(src.register()))
        .test(ch, ch)
        .jz("print_done")
        .mov(MemoryOperand::byte(dst.register()), ch)
        .mov(MemoryOperand::byte(dst.register()).disp(1), 0x0F)
        .inc(src.register())
        .add(dst.register(), 2)
        .jmp("print_loop")
        .label("print_done")
        .inc(MemoryOperand::label(OperandSize::Dword, "Kernel::ticks"))
        .ret();
    asm.registers_mut().release(tmp).unwrap();
    asm.registers_mut().release(dst).unwrap();
    asm.registers_mut().release(src).unwrap();
    asm.end_method().unwrap();
    program = program.method(MethodCode::new("kernel_main", body));

    // --- clear_screen: 80x25 blank cells ---
    asm.begin_method("clear_screen");
    let mut body = InstructionStream::new();
    body.push(Register::Edi)
        .mov(Register::Edi, VGA)
        .mov(Register::Ecx, 80 * 25)
        .label("clear_loop")
        .mov(MemoryOperand::word(Register::Edi), 0x0F20)
        .add(Register::Edi, 2)
        .dec(Register::Ecx)
        .jnz("clear_loop")
        .pop(Register::Edi)
        .ret();
    asm.end_method().unwrap();
    program = program.method(MethodCode::new("clear_screen", body));

    program = program.static_field(StaticField::new("Kernel::ticks", FieldType::U4));

    let image = match asm.build_image(&program, &ImageConfig::default()) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    println!(
        "{} bytes, {} pass(es), {} short jump(s)",
        image.len(),
        image.passes(),
        image.shrunk()
    );
    for (name, addr) in image.labels() {
        println!("  {:#010X}  {}", addr, name);
    }

    if let Err(e) = image.write_file(&path) {
        eprintln!("error: cannot write {path}: {e}");
        std::process::exit(1);
    }
    println!("wrote {path}");
}
