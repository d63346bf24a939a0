//! The instruction stream and its builders.
//!
//! Every builder appends exactly one instruction and returns `&mut Self`, so
//! code reads top to bottom in program order:
//!
//! ```
//! use flatasm::{InstructionStream, Linker, Register};
//!
//! let mut code = InstructionStream::new();
//! code.org(0x0010_0000)
//!     .label("spin")
//!     .cli()
//!     .hlt()
//!     .jmp("spin");
//! let image = Linker::new().link(code.instructions())?;
//! assert_eq!(image.bytes(), &[0xFA, 0xF4, 0xEB, 0xFC]);
//! # Ok::<(), flatasm::AsmError>(())
//! ```

use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::error::AsmError;
use crate::ir::*;
use crate::linker::{EncodedImage, Linker};
use crate::resolver::{resolve_label, LabelAddress};

/// An ordered list of instructions. Order is program order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstructionStream {
    instructions: Vec<Instruction>,
}

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $name:ident => $mnemonic:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> &mut Self {
                self.machine($mnemonic, vec![dst.into(), src.into()])
            }
        )*
    };
}

macro_rules! unary_ops {
    ($($(#[$doc:meta])* $name:ident => $mnemonic:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, op: impl Into<Operand>) -> &mut Self {
                self.machine($mnemonic, vec![op.into()])
            }
        )*
    };
}

macro_rules! nullary_ops {
    ($($(#[$doc:meta])* $name:ident => $mnemonic:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self) -> &mut Self {
                self.machine($mnemonic, Vec::new())
            }
        )*
    };
}

macro_rules! jcc_aliases {
    ($($name:ident => $cc:ident;)*) => {
        $(
            #[doc = concat!("`", stringify!($name), " label`")]
            pub fn $name(&mut self, label: &str) -> &mut Self {
                self.jcc(Condition::$cc, label)
            }
        )*
    };
}

impl InstructionStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instruction at the tail.
    pub fn append(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Append every instruction of `other`, in order.
    pub fn append_all(&mut self, other: impl IntoIterator<Item = Instruction>) -> &mut Self {
        self.instructions.extend(other);
        self
    }

    /// The instructions in program order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Consume the stream.
    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Iterate in program order.
    pub fn iter(&self) -> core::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Image offset and absolute address of a label, by linear replay.
    pub fn resolve_label(&self, name: &str) -> Result<LabelAddress, AsmError> {
        resolve_label(&self.instructions, name)
    }

    /// Encode the stream with a default [`Linker`].
    pub fn encode(&self) -> Result<EncodedImage, AsmError> {
        Linker::new().link(&self.instructions)
    }

    // ── pseudo-instructions ────────────────────────────────

    /// Switch to 32-bit (`true`) or 16-bit (`false`) encodings.
    pub fn bits32(&mut self, bits32: bool) -> &mut Self {
        self.append(Instruction::Bits32(bits32))
    }

    /// Set the origin for what follows.
    pub fn org(&mut self, origin: u32) -> &mut Self {
        self.append(Instruction::Org(origin))
    }

    /// Pad to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: u32) -> &mut Self {
        self.append(Instruction::Align(alignment))
    }

    /// Emit `length` copies of `fill`.
    pub fn times(&mut self, length: u32, fill: u8) -> &mut Self {
        self.append(Instruction::Times { length, fill })
    }

    /// Move the cursor forward to image offset `offset`.
    pub fn offset(&mut self, offset: u32) -> &mut Self {
        self.append(Instruction::Offset(offset))
    }

    /// Define a label at the current position.
    pub fn label(&mut self, name: impl Into<String>) -> &mut Self {
        self.append(Instruction::Label(name.into()))
    }

    fn data(&mut self, label: Option<String>, value: DataValue) -> &mut Self {
        self.append(Instruction::Data { label, value })
    }

    /// Raw bytes.
    pub fn db(&mut self, bytes: &[u8]) -> &mut Self {
        self.data(None, DataValue::Bytes(bytes.to_vec()))
    }

    /// A little-endian word.
    pub fn dw(&mut self, value: u16) -> &mut Self {
        self.data(None, DataValue::Word(value))
    }

    /// A little-endian dword.
    pub fn dd(&mut self, value: u32) -> &mut Self {
        self.data(None, DataValue::Dword(value))
    }

    /// The absolute address of `label`, as a dword.
    pub fn dd_address(&mut self, label: impl Into<String>) -> &mut Self {
        self.data(None, DataValue::Address(label.into()))
    }

    /// A labeled, NUL-terminated string.
    pub fn data_string(&mut self, label: impl Into<String>, text: &str) -> &mut Self {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.data(Some(label.into()), DataValue::Bytes(bytes))
    }

    /// A labeled data value.
    pub fn named_data(&mut self, label: impl Into<String>, value: DataValue) -> &mut Self {
        self.data(Some(label.into()), value)
    }

    // ── machine instructions ───────────────────────────────

    /// Append a machine instruction.
    pub fn machine(&mut self, mnemonic: Mnemonic, operands: Vec<Operand>) -> &mut Self {
        self.append(Instruction::machine(mnemonic, operands))
    }

    binary_ops! {
        /// `mov dst, src`
        mov => Mnemonic::Mov;
        /// `movzx dst, src`
        movzx => Mnemonic::Movzx;
        /// `movsx dst, src`
        movsx => Mnemonic::Movsx;
        /// `lea dst, [mem]`
        lea => Mnemonic::Lea;
        /// `add dst, src`
        add => Mnemonic::Add;
        /// `or dst, src`
        or => Mnemonic::Or;
        /// `adc dst, src`
        adc => Mnemonic::Adc;
        /// `sbb dst, src`
        sbb => Mnemonic::Sbb;
        /// `and dst, src`
        and => Mnemonic::And;
        /// `sub dst, src`
        sub => Mnemonic::Sub;
        /// `xor dst, src`
        xor => Mnemonic::Xor;
        /// `cmp dst, src`
        cmp => Mnemonic::Cmp;
        /// `test dst, src`
        test => Mnemonic::Test;
        /// `shl dst, count` (count is `cl` or an immediate)
        shl => Mnemonic::Shl;
        /// `shr dst, count`
        shr => Mnemonic::Shr;
        /// `sar dst, count`
        sar => Mnemonic::Sar;
        /// `rol dst, count`
        rol => Mnemonic::Rol;
        /// `ror dst, count`
        ror => Mnemonic::Ror;
        /// `xchg a, b`
        xchg => Mnemonic::Xchg;
        /// `in accumulator, port` (port is an imm8 or `dx`)
        in_ => Mnemonic::In;
        /// `imul dst, src`
        imul2 => Mnemonic::Imul;
    }

    unary_ops! {
        /// `not op`
        not => Mnemonic::Not;
        /// `neg op`
        neg => Mnemonic::Neg;
        /// `mul op`
        mul => Mnemonic::Mul;
        /// `imul op`
        imul => Mnemonic::Imul;
        /// `div op`
        div => Mnemonic::Div;
        /// `idiv op`
        idiv => Mnemonic::Idiv;
        /// `inc op`
        inc => Mnemonic::Inc;
        /// `dec op`
        dec => Mnemonic::Dec;
        /// `push op`
        push => Mnemonic::Push;
        /// `pop op`
        pop => Mnemonic::Pop;
        /// `call target` (a label is relative, a register or memory indirect)
        call => Mnemonic::Call;
        /// `jmp target`
        jmp => Mnemonic::Jmp;
        /// `lgdt [mem]`
        lgdt => Mnemonic::Lgdt;
        /// `lidt [mem]`
        lidt => Mnemonic::Lidt;
    }

    nullary_ops! {
        /// `ret`
        ret => Mnemonic::Ret;
        /// `nop`
        nop => Mnemonic::Nop;
        /// `hlt`
        hlt => Mnemonic::Hlt;
        /// `cli`
        cli => Mnemonic::Cli;
        /// `sti`
        sti => Mnemonic::Sti;
        /// `cld`
        cld => Mnemonic::Cld;
        /// `std`
        std => Mnemonic::Std;
        /// `iretd`
        iret => Mnemonic::Iret;
        /// `pushad`
        pushad => Mnemonic::Pushad;
        /// `popad`
        popad => Mnemonic::Popad;
        /// `pushfd`
        pushfd => Mnemonic::Pushfd;
        /// `popfd`
        popfd => Mnemonic::Popfd;
        /// `cdq`
        cdq => Mnemonic::Cdq;
        /// `leave`
        leave => Mnemonic::Leave;
        /// `int3`
        int3 => Mnemonic::Int3;
    }

    /// `imul dst, src, imm`
    pub fn imul3(&mut self, dst: Register, src: impl Into<Operand>, imm: i32) -> &mut Self {
        self.machine(Mnemonic::Imul, vec![dst.into(), src.into(), imm.into()])
    }

    /// `out port, accumulator` (port is an imm8 or `dx`)
    pub fn out(&mut self, port: impl Into<Operand>, acc: Register) -> &mut Self {
        self.machine(Mnemonic::Out, vec![port.into(), acc.into()])
    }

    /// `ret n`: return and pop `n` bytes of arguments.
    pub fn ret_n(&mut self, n: u16) -> &mut Self {
        self.machine(Mnemonic::Ret, vec![n.into()])
    }

    /// `int vector`
    pub fn int(&mut self, vector: u8) -> &mut Self {
        self.machine(Mnemonic::Int, vec![vector.into()])
    }

    /// `jcc label`
    pub fn jcc(&mut self, cc: Condition, label: &str) -> &mut Self {
        self.machine(Mnemonic::Jcc(cc), vec![Operand::label(label)])
    }

    /// `setcc op` (an 8-bit register or byte memory operand)
    pub fn setcc(&mut self, cc: Condition, op: impl Into<Operand>) -> &mut Self {
        self.machine(Mnemonic::Setcc(cc), vec![op.into()])
    }

    jcc_aliases! {
        je => E;
        jz => E;
        jne => Ne;
        jnz => Ne;
        jb => B;
        jae => Ae;
        ja => A;
        jbe => Be;
        jl => L;
        jge => Ge;
        jg => G;
        jle => Le;
    }
}

impl core::ops::Index<usize> for InstructionStream {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.instructions[index]
    }
}

impl<'a> IntoIterator for &'a InstructionStream {
    type Item = &'a Instruction;
    type IntoIter = core::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl FromIterator<Instruction> for InstructionStream {
    fn from_iter<I: IntoIterator<Item = Instruction>>(iter: I) -> Self {
        Self {
            instructions: iter.into_iter().collect(),
        }
    }
}

impl Extend<Instruction> for InstructionStream {
    fn extend<I: IntoIterator<Item = Instruction>>(&mut self, iter: I) {
        self.instructions.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Register::*;

    #[test]
    fn builders_append_in_order() {
        let mut s = InstructionStream::new();
        s.label("entry").mov(Eax, 1).push(Eax).call("f").ret();
        assert_eq!(s.len(), 5);
        assert_eq!(s[0], Instruction::Label("entry".into()));
        assert_eq!(
            s[1],
            Instruction::machine(Mnemonic::Mov, vec![Eax.into(), Operand::Immediate(1)])
        );
        assert_eq!(
            s[3],
            Instruction::machine(Mnemonic::Call, vec![Operand::label("f")])
        );
        assert_eq!(s[4], Instruction::machine(Mnemonic::Ret, vec![]));
    }

    #[test]
    fn jcc_aliases_share_conditions() {
        let mut s = InstructionStream::new();
        s.jz("a").je("a").jnz("b").jne("b");
        assert_eq!(s[0], s[1]);
        assert_eq!(s[2], s[3]);
        assert_eq!(
            s[2],
            Instruction::machine(Mnemonic::Jcc(Condition::Ne), vec![Operand::label("b")])
        );
    }

    #[test]
    fn data_builders() {
        let mut s = InstructionStream::new();
        s.data_string("msg", "hi").dd_address("msg").dw(0xAA55);
        assert_eq!(
            s[0],
            Instruction::Data {
                label: Some("msg".into()),
                value: DataValue::Bytes(vec![b'h', b'i', 0]),
            }
        );
        assert_eq!(s[1].reference().map(|r| r.label), Some("msg"));
        let image = s.encode().unwrap();
        assert_eq!(image.bytes(), &[b'h', b'i', 0, 0, 0, 0, 0, 0x55, 0xAA]);
    }

    #[test]
    fn stream_sizes_depend_on_mode() {
        let mut s = InstructionStream::new();
        s.mov(Eax, 0x1234_5678).push(Ax).ret_n(4);
        assert_eq!(s[0].size(true).unwrap(), 5);
        assert_eq!(s[0].size(false).unwrap(), 6);
        assert!(s[0].size_depends_on_mode().unwrap());
        assert_eq!(s[1].size(true).unwrap(), 2);
        assert_eq!(s[1].size(false).unwrap(), 1);
        assert!(!s[2].size_depends_on_mode().unwrap());
    }

    #[test]
    fn resolve_through_stream() {
        let mut s = InstructionStream::new();
        s.org(0x7C00).bits32(false).cli().label("boot");
        let at = s.resolve_label("BOOT").unwrap();
        assert_eq!(at.offset, 1);
        assert_eq!(at.address, 0x7C01);
    }

    #[test]
    fn collect_and_extend() {
        let mut s: InstructionStream = vec![Instruction::Label("a".into())].into_iter().collect();
        s.extend(vec![Instruction::machine(Mnemonic::Nop, vec![])]);
        assert_eq!(s.iter().count(), 2);
        assert_eq!((&s).into_iter().filter(|i| i.is_pseudo()).count(), 1);
    }
}
