#![no_main]
use flatasm::{Condition, InstructionStream, Linker, MemoryOperand, Register};
use libfuzzer_sys::fuzz_target;

const REGS: [Register; 12] = [
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Ebx,
    Register::Esp,
    Register::Ebp,
    Register::Esi,
    Register::Edi,
    Register::Ax,
    Register::Bx,
    Register::Al,
    Register::Cl,
];

fn reg(b: u8) -> Register {
    REGS[b as usize % REGS.len()]
}

fn label(b: u8) -> String {
    format!("l{}", b % 8)
}

fuzz_target!(|data: &[u8]| {
    // Build a stream from byte triples; encoding must never panic, only
    // return Ok/Err.
    let mut code = InstructionStream::new();
    for chunk in data.chunks_exact(3) {
        let (op, a, b) = (chunk[0], chunk[1], chunk[2]);
        match op % 16 {
            0 => {
                code.label(label(a));
            }
            1 => {
                code.jmp(label(a).as_str());
            }
            2 => {
                code.jcc(Condition::Ne, &label(a));
            }
            3 => {
                code.call(label(a).as_str());
            }
            4 => {
                code.times(u32::from(a), b);
            }
            5 => {
                code.align(u32::from(a % 16));
            }
            6 => {
                code.mov(reg(a), reg(b));
            }
            7 => {
                code.mov(reg(a), i32::from(b as i8));
            }
            8 => {
                code.add(reg(a), MemoryOperand::dword(reg(b)).disp(i32::from(a)));
            }
            9 => {
                code.mov(
                    reg(a),
                    MemoryOperand::dword(reg(b)).index(reg(a), 1 << (b % 4)),
                );
            }
            10 => {
                code.bits32(a % 2 == 0);
            }
            11 => {
                code.org(u32::from(a) << 12);
            }
            12 => {
                code.offset(u32::from(a) * 4);
            }
            13 => {
                code.dd_address(label(a));
            }
            14 => {
                code.shl(reg(a), reg(b));
            }
            _ => {
                code.push(reg(a)).pop(reg(b));
            }
        }
    }

    let _ = Linker::new().link(code.instructions());
    let _ = Linker::new().bss_marker("l0").link(code.instructions());
    for i in 0..8 {
        let _ = code.resolve_label(&format!("l{i}"));
    }
});
