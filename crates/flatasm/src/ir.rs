//! Intermediate representation: registers, memory operands, instructions,
//! and pseudo-instructions.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::error::AsmError;

// ─── Registers ──────────────────────────────────────────────────────────────

/// An x86 register usable in 16-bit and 32-bit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Register {
    // 32-bit general purpose
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    // 16-bit general purpose
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    // 8-bit general purpose
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    // Segment registers
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl Register {
    /// The 3-bit register number used in ModR/M, SIB and `+r` opcodes.
    pub fn base_code(self) -> u8 {
        use Register::*;
        match self {
            Eax | Ax | Al | Es => 0,
            Ecx | Cx | Cl | Cs => 1,
            Edx | Dx | Dl | Ss => 2,
            Ebx | Bx | Bl | Ds => 3,
            Esp | Sp | Ah | Fs => 4,
            Ebp | Bp | Ch | Gs => 5,
            Esi | Si | Dh => 6,
            Edi | Di | Bh => 7,
        }
    }

    /// Register width in bits. Segment registers are 16 bits wide.
    pub fn size_bits(self) -> u8 {
        use Register::*;
        match self {
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi => 32,
            Ax | Cx | Dx | Bx | Sp | Bp | Si | Di => 16,
            Al | Cl | Dl | Bl | Ah | Ch | Dh | Bh => 8,
            Es | Cs | Ss | Ds | Fs | Gs => 16,
        }
    }

    /// Whether this is a segment register.
    pub fn is_segment(self) -> bool {
        matches!(
            self,
            Register::Es | Register::Cs | Register::Ss | Register::Ds | Register::Fs | Register::Gs
        )
    }

    /// Whether this is a general-purpose register.
    pub fn is_general(self) -> bool {
        !self.is_segment()
    }

    /// Lower-case assembler name.
    pub fn name(self) -> &'static str {
        use Register::*;
        match self {
            Eax => "eax",
            Ecx => "ecx",
            Edx => "edx",
            Ebx => "ebx",
            Esp => "esp",
            Ebp => "ebp",
            Esi => "esi",
            Edi => "edi",
            Ax => "ax",
            Cx => "cx",
            Dx => "dx",
            Bx => "bx",
            Sp => "sp",
            Bp => "bp",
            Si => "si",
            Di => "di",
            Al => "al",
            Cl => "cl",
            Dl => "dl",
            Bl => "bl",
            Ah => "ah",
            Ch => "ch",
            Dh => "dh",
            Bh => "bh",
            Es => "es",
            Cs => "cs",
            Ss => "ss",
            Ds => "ds",
            Fs => "fs",
            Gs => "gs",
        }
    }

    /// Segment-override prefix byte for a segment register.
    pub(crate) fn segment_prefix(self) -> Option<u8> {
        match self {
            Register::Es => Some(0x26),
            Register::Cs => Some(0x2E),
            Register::Ss => Some(0x36),
            Register::Ds => Some(0x3E),
            Register::Fs => Some(0x64),
            Register::Gs => Some(0x65),
            _ => None,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Condition codes ────────────────────────────────────────────────────────

/// Condition code for `Jcc` and `SETcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    /// Overflow.
    O,
    /// Not overflow.
    No,
    /// Below / carry.
    B,
    /// Above or equal / not carry.
    Ae,
    /// Equal / zero.
    E,
    /// Not equal / not zero.
    Ne,
    /// Below or equal.
    Be,
    /// Above.
    A,
    /// Sign.
    S,
    /// Not sign.
    Ns,
    /// Parity even.
    P,
    /// Parity odd.
    Np,
    /// Less (signed).
    L,
    /// Greater or equal (signed).
    Ge,
    /// Less or equal (signed).
    Le,
    /// Greater (signed).
    G,
}

impl Condition {
    /// The 4-bit condition field added to `0x70`, `0x0F 0x80` and `0x0F 0x90`.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Mnemonic suffix (`ne` in `jne`).
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::O => "o",
            Condition::No => "no",
            Condition::B => "b",
            Condition::Ae => "ae",
            Condition::E => "e",
            Condition::Ne => "ne",
            Condition::Be => "be",
            Condition::A => "a",
            Condition::S => "s",
            Condition::Ns => "ns",
            Condition::P => "p",
            Condition::Np => "np",
            Condition::L => "l",
            Condition::Ge => "ge",
            Condition::Le => "le",
            Condition::G => "g",
        }
    }
}

// ─── Memory operands ────────────────────────────────────────────────────────

/// Width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandSize {
    /// 8-bit.
    Byte,
    /// 16-bit.
    Word,
    /// 32-bit.
    Dword,
    /// 64-bit.
    Qword,
    /// 80-bit extended word.
    Tword,
}

impl OperandSize {
    /// Width in bits.
    pub fn bits(self) -> u16 {
        match self {
            OperandSize::Byte => 8,
            OperandSize::Word => 16,
            OperandSize::Dword => 32,
            OperandSize::Qword => 64,
            OperandSize::Tword => 80,
        }
    }
}

impl fmt::Display for OperandSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandSize::Byte => write!(f, "byte"),
            OperandSize::Word => write!(f, "word"),
            OperandSize::Dword => write!(f, "dword"),
            OperandSize::Qword => write!(f, "qword"),
            OperandSize::Tword => write!(f, "tword"),
        }
    }
}

/// Displacement of a memory operand: a literal, or a label plus a constant
/// delta resolved only once every label address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Displacement {
    /// A literal signed displacement.
    Literal(i32),
    /// `label + delta`, resolved to an absolute address at encode time.
    Label {
        /// Target label name.
        name: String,
        /// Constant added to the label address.
        delta: i32,
    },
}

impl Default for Displacement {
    fn default() -> Self {
        Displacement::Literal(0)
    }
}

/// A memory (indirect) operand: `size [seg:base + index*scale + disp]`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryOperand {
    /// Access width; selects the opcode variant for memory-only forms.
    pub size: OperandSize,
    /// Segment override, if any.
    pub segment: Option<Register>,
    /// Base register.
    pub base: Option<Register>,
    /// Index register.
    pub index: Option<Register>,
    /// Index scale factor: 1, 2, 4, or 8.
    pub scale: u8,
    /// Literal or symbolic displacement.
    pub displacement: Displacement,
}

impl MemoryOperand {
    /// An operand of the given width with no registers and a zero displacement.
    pub fn new(size: OperandSize) -> Self {
        Self {
            size,
            segment: None,
            base: None,
            index: None,
            scale: 1,
            displacement: Displacement::Literal(0),
        }
    }

    /// `byte [base]`
    pub fn byte(base: Register) -> Self {
        Self::new(OperandSize::Byte).base(base)
    }

    /// `word [base]`
    pub fn word(base: Register) -> Self {
        Self::new(OperandSize::Word).base(base)
    }

    /// `dword [base]`
    pub fn dword(base: Register) -> Self {
        Self::new(OperandSize::Dword).base(base)
    }

    /// `qword [base]`
    pub fn qword(base: Register) -> Self {
        Self::new(OperandSize::Qword).base(base)
    }

    /// `tword [base]`
    pub fn tword(base: Register) -> Self {
        Self::new(OperandSize::Tword).base(base)
    }

    /// `size [address]` with no base or index register.
    pub fn absolute(size: OperandSize, address: i32) -> Self {
        Self::new(size).disp(address)
    }

    /// `size [label]`, resolved to the label's absolute address.
    pub fn label(size: OperandSize, name: impl Into<String>) -> Self {
        Self::new(size).label_delta(name, 0)
    }

    /// Set the base register.
    pub fn base(mut self, base: Register) -> Self {
        self.base = Some(base);
        self
    }

    /// Set a segment override.
    pub fn segment(mut self, segment: Register) -> Self {
        self.segment = Some(segment);
        self
    }

    /// Set the index register and scale.
    pub fn index(mut self, index: Register, scale: u8) -> Self {
        self.index = Some(index);
        self.scale = scale;
        self
    }

    /// Set a literal displacement.
    pub fn disp(mut self, disp: i32) -> Self {
        self.displacement = Displacement::Literal(disp);
        self
    }

    /// Set a symbolic displacement `name + delta`.
    pub fn label_delta(mut self, name: impl Into<String>, delta: i32) -> Self {
        self.displacement = Displacement::Label {
            name: name.into(),
            delta,
        };
        self
    }

    /// The label of a symbolic displacement, with its delta.
    pub fn label_ref(&self) -> Option<(&str, i32)> {
        match &self.displacement {
            Displacement::Label { name, delta } => Some((name, *delta)),
            Displacement::Literal(_) => None,
        }
    }

    /// Address width of this operand: 32 for 32-bit registers, 16 for
    /// 16-bit registers, the mode default when no register is used.
    pub fn address_size(&self, bits32: bool) -> Result<u8, AsmError> {
        let mut size = None;
        for reg in [self.base, self.index].into_iter().flatten() {
            let bits = reg.size_bits();
            if reg.is_segment() || bits == 8 {
                return Err(AsmError::unsupported(format!(
                    "'{}' as an address register",
                    reg
                )));
            }
            match size {
                None => size = Some(bits),
                Some(prev) if prev != bits => {
                    return Err(AsmError::unsupported(format!(
                        "mixed 16/32-bit address registers in '{}'",
                        self
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(size.unwrap_or(if bits32 { 32 } else { 16 }))
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.size)?;
        if let Some(seg) = self.segment {
            write!(f, "{}:", seg)?;
        }
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}", index)?;
            if self.scale != 1 {
                write!(f, "*{}", self.scale)?;
            }
            first = false;
        }
        match &self.displacement {
            Displacement::Literal(0) if !first => {}
            Displacement::Literal(d) if first => write!(f, "0x{:X}", d)?,
            Displacement::Literal(d) if *d < 0 => write!(f, "-{}", d.unsigned_abs())?,
            Displacement::Literal(d) => write!(f, "+{}", d)?,
            Displacement::Label { name, delta } => {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                if *delta < 0 {
                    write!(f, "-{}", delta.unsigned_abs())?;
                } else if *delta > 0 {
                    write!(f, "+{}", delta)?;
                }
            }
        }
        f.write_str("]")
    }
}

// ─── Operands ───────────────────────────────────────────────────────────────

/// A single instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// A register.
    Register(Register),
    /// An immediate value.
    Immediate(i64),
    /// A memory reference.
    Memory(MemoryOperand),
    /// A label: a relative target for branches, an absolute address otherwise.
    Label(String),
}

impl Operand {
    /// Label operand constructor.
    pub fn label(name: impl Into<String>) -> Self {
        Operand::Label(name.into())
    }
}

impl From<Register> for Operand {
    fn from(reg: Register) -> Self {
        Operand::Register(reg)
    }
}

impl From<MemoryOperand> for Operand {
    fn from(mem: MemoryOperand) -> Self {
        Operand::Memory(mem)
    }
}

impl From<&str> for Operand {
    fn from(label: &str) -> Self {
        Operand::Label(String::from(label))
    }
}

impl From<String> for Operand {
    fn from(label: String) -> Self {
        Operand::Label(label)
    }
}

macro_rules! operand_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Immediate(value as i64)
                }
            }
        )*
    };
}

operand_from_int!(i8, u8, i16, u16, i32, u32, i64);

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{}", r),
            Operand::Immediate(v) if (-9..=9).contains(v) => write!(f, "{}", v),
            Operand::Immediate(v) if *v < 0 => write!(f, "-0x{:X}", v.unsigned_abs()),
            Operand::Immediate(v) => write!(f, "0x{:X}", v),
            Operand::Memory(m) => write!(f, "{}", m),
            Operand::Label(l) => f.write_str(l),
        }
    }
}

// ─── Mnemonics ──────────────────────────────────────────────────────────────

/// The closed set of machine instructions the encoder has tables for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mnemonic {
    /// Move.
    Mov,
    /// Move with zero extension.
    Movzx,
    /// Move with sign extension.
    Movsx,
    /// Load effective address.
    Lea,
    /// Add.
    Add,
    /// Bitwise or.
    Or,
    /// Add with carry.
    Adc,
    /// Subtract with borrow.
    Sbb,
    /// Bitwise and.
    And,
    /// Subtract.
    Sub,
    /// Bitwise exclusive or.
    Xor,
    /// Compare, setting flags only.
    Cmp,
    /// Bitwise and, setting flags only.
    Test,
    /// One's complement.
    Not,
    /// Two's complement.
    Neg,
    /// Unsigned multiply into the accumulator.
    Mul,
    /// Signed multiply, one to three operands.
    Imul,
    /// Unsigned divide of the accumulator.
    Div,
    /// Signed divide of the accumulator.
    Idiv,
    /// Increment by one.
    Inc,
    /// Decrement by one.
    Dec,
    /// Rotate left.
    Rol,
    /// Rotate right.
    Ror,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    /// Push onto the stack.
    Push,
    /// Pop off the stack.
    Pop,
    /// Near call, relative or indirect.
    Call,
    /// Near return, optionally releasing stack bytes.
    Ret,
    /// Unconditional near jump, relative or indirect.
    Jmp,
    /// Conditional relative jump.
    Jcc(Condition),
    /// Set a byte to 0 or 1 from a condition.
    Setcc(Condition),
    /// Exchange.
    Xchg,
    /// Read from an I/O port.
    In,
    /// Write to an I/O port.
    Out,
    /// Software interrupt.
    Int,
    /// Load the global descriptor table register.
    Lgdt,
    /// Load the interrupt descriptor table register.
    Lidt,
    /// No operation.
    Nop,
    /// Halt until the next interrupt.
    Hlt,
    /// Clear the interrupt flag.
    Cli,
    /// Set the interrupt flag.
    Sti,
    /// Clear the direction flag.
    Cld,
    /// Set the direction flag.
    Std,
    /// Return from an interrupt.
    Iret,
    /// Push all general registers.
    Pushad,
    /// Pop all general registers.
    Popad,
    /// Push EFLAGS.
    Pushfd,
    /// Pop EFLAGS.
    Popfd,
    /// Sign-extend EAX into EDX.
    Cdq,
    /// Tear down the stack frame.
    Leave,
    /// Breakpoint trap.
    Int3,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mnemonic::Jcc(cc) => return write!(f, "j{}", cc.suffix()),
            Mnemonic::Setcc(cc) => return write!(f, "set{}", cc.suffix()),
            Mnemonic::Mov => "mov",
            Mnemonic::Movzx => "movzx",
            Mnemonic::Movsx => "movsx",
            Mnemonic::Lea => "lea",
            Mnemonic::Add => "add",
            Mnemonic::Or => "or",
            Mnemonic::Adc => "adc",
            Mnemonic::Sbb => "sbb",
            Mnemonic::And => "and",
            Mnemonic::Sub => "sub",
            Mnemonic::Xor => "xor",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Test => "test",
            Mnemonic::Not => "not",
            Mnemonic::Neg => "neg",
            Mnemonic::Mul => "mul",
            Mnemonic::Imul => "imul",
            Mnemonic::Div => "div",
            Mnemonic::Idiv => "idiv",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Rol => "rol",
            Mnemonic::Ror => "ror",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Sar => "sar",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Call => "call",
            Mnemonic::Ret => "ret",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Xchg => "xchg",
            Mnemonic::In => "in",
            Mnemonic::Out => "out",
            Mnemonic::Int => "int",
            Mnemonic::Lgdt => "lgdt",
            Mnemonic::Lidt => "lidt",
            Mnemonic::Nop => "nop",
            Mnemonic::Hlt => "hlt",
            Mnemonic::Cli => "cli",
            Mnemonic::Sti => "sti",
            Mnemonic::Cld => "cld",
            Mnemonic::Std => "std",
            Mnemonic::Iret => "iretd",
            Mnemonic::Pushad => "pushad",
            Mnemonic::Popad => "popad",
            Mnemonic::Pushfd => "pushfd",
            Mnemonic::Popfd => "popfd",
            Mnemonic::Cdq => "cdq",
            Mnemonic::Leave => "leave",
            Mnemonic::Int3 => "int3",
        };
        f.write_str(name)
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// Encoding form of a relative branch.
///
/// Every branch is built near; pass 1 of the linker may switch it to short,
/// never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchForm {
    /// rel16/rel32 displacement.
    #[default]
    Near,
    /// rel8 displacement.
    Short,
}

/// A real machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Machine {
    /// The instruction mnemonic.
    pub mnemonic: Mnemonic,
    /// Operands in Intel order (destination first).
    pub operands: Vec<Operand>,
}

impl Machine {
    /// Create a machine instruction.
    pub fn new(mnemonic: Mnemonic, operands: Vec<Operand>) -> Self {
        Self { mnemonic, operands }
    }

    fn is_branch(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Jmp | Mnemonic::Jcc(_) | Mnemonic::Call
        )
    }

    fn single_label(&self) -> Option<&str> {
        match self.operands.as_slice() {
            [Operand::Label(label)] => Some(label),
            _ => None,
        }
    }

    /// Target label of a relative branch (`jmp`, `jcc`, `call`).
    pub fn branch_target(&self) -> Option<&str> {
        if self.is_branch() {
            self.single_label()
        } else {
            None
        }
    }

    /// Whether pass 1 may switch this instruction to its short form.
    pub fn is_shrinkable(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Jmp | Mnemonic::Jcc(_)) && self.single_label().is_some()
    }

    /// Label used as an absolute address (`mov eax, label`, `push label`).
    pub fn absolute_label(&self) -> Option<&str> {
        if self.is_branch() {
            return None;
        }
        self.operands.iter().find_map(|op| match op {
            Operand::Label(label) => Some(label.as_str()),
            _ => None,
        })
    }

    /// The attached memory operand, if any.
    pub fn memory(&self) -> Option<&MemoryOperand> {
        self.operands.iter().find_map(|op| match op {
            Operand::Memory(mem) => Some(mem),
            _ => None,
        })
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

/// Payload of a data directive.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataValue {
    /// Raw bytes (`db`).
    Bytes(Vec<u8>),
    /// A little-endian word (`dw`).
    Word(u16),
    /// A little-endian dword (`dd`).
    Dword(u32),
    /// The absolute address of a label as a dword, patched during pass 1.
    Address(String),
}

impl DataValue {
    /// Number of bytes emitted.
    pub fn len(&self) -> usize {
        match self {
            DataValue::Bytes(b) => b.len(),
            DataValue::Word(_) => 2,
            DataValue::Dword(_) | DataValue::Address(_) => 4,
        }
    }

    /// Whether no bytes are emitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a reference is encoded as an absolute address or a displacement
/// from the end of the referencing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Absolute address: origin + label offset.
    Absolute,
    /// Signed displacement from the end of the instruction.
    Relative,
}

/// A symbolic reference carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference<'a> {
    /// Target label.
    pub label: &'a str,
    /// How the resolved value is encoded.
    pub kind: RefKind,
}

/// One entry of the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instruction {
    /// Switch between 32-bit (`true`) and 16-bit (`false`) encodings.
    Bits32(bool),
    /// Load address of image offset zero for what follows.
    Org(u32),
    /// Pad to the next multiple of N.
    Align(u32),
    /// Emit `length` copies of `fill`.
    Times {
        /// Number of bytes.
        length: u32,
        /// Fill byte.
        fill: u8,
    },
    /// Move the cursor forward to an absolute image offset.
    Offset(u32),
    /// Zero-size address marker.
    Label(String),
    /// Raw data, optionally labeled.
    Data {
        /// Optional label placed at the first byte.
        label: Option<String>,
        /// The emitted value.
        value: DataValue,
    },
    /// A real machine instruction.
    Machine(Machine),
}

impl Instruction {
    /// Build a machine instruction entry.
    pub fn machine(mnemonic: Mnemonic, operands: Vec<Operand>) -> Self {
        Instruction::Machine(Machine::new(mnemonic, operands))
    }

    /// The label this instruction defines.
    pub fn label(&self) -> Option<&str> {
        match self {
            Instruction::Label(name) => Some(name),
            Instruction::Data {
                label: Some(name), ..
            } => Some(name),
            _ => None,
        }
    }

    /// Whether this instruction defines `name` (case-insensitive).
    pub fn defines(&self, name: &str) -> bool {
        self.label().is_some_and(|l| l.eq_ignore_ascii_case(name))
    }

    /// The symbolic reference this instruction must resolve, if any.
    ///
    /// Symbolic memory displacements are reported separately by
    /// [`Instruction::memory`].
    pub fn reference(&self) -> Option<Reference<'_>> {
        match self {
            Instruction::Machine(m) => {
                if let Some(label) = m.branch_target() {
                    Some(Reference {
                        label,
                        kind: RefKind::Relative,
                    })
                } else {
                    m.absolute_label().map(|label| Reference {
                        label,
                        kind: RefKind::Absolute,
                    })
                }
            }
            Instruction::Data {
                value: DataValue::Address(label),
                ..
            } => Some(Reference {
                label,
                kind: RefKind::Absolute,
            }),
            _ => None,
        }
    }

    /// Whether the reference is relative.
    pub fn is_relative(&self) -> bool {
        self.reference()
            .is_some_and(|r| r.kind == RefKind::Relative)
    }

    /// The attached memory operand, if any.
    pub fn memory(&self) -> Option<&MemoryOperand> {
        match self {
            Instruction::Machine(m) => m.memory(),
            _ => None,
        }
    }

    /// Whether this is a pseudo-instruction.
    pub fn is_pseudo(&self) -> bool {
        !matches!(self, Instruction::Machine(_))
    }

    /// Mnemonic name (`jmp`, `org`, `times`, ...).
    pub fn name(&self) -> String {
        match self {
            Instruction::Bits32(_) => String::from("bits"),
            Instruction::Org(_) => String::from("org"),
            Instruction::Align(_) => String::from("align"),
            Instruction::Times { .. } => String::from("times"),
            Instruction::Offset(_) => String::from("offset"),
            Instruction::Label(_) => String::from("label"),
            Instruction::Data { value, .. } => String::from(match value {
                DataValue::Bytes(_) => "db",
                DataValue::Word(_) => "dw",
                DataValue::Dword(_) | DataValue::Address(_) => "dd",
            }),
            Instruction::Machine(m) => format!("{}", m.mnemonic),
        }
    }

    /// Encoded length in bytes under the given mode, in the form the
    /// instruction was built (branches near).
    ///
    /// `Align` and `Offset` depend on the position and report zero here;
    /// `Times` reports its fill length.
    pub fn size(&self, bits32: bool) -> Result<u64, AsmError> {
        crate::encoder::encoded_len(self, bits32, BranchForm::Near)
    }

    /// Whether the encoded length differs between 16-bit and 32-bit mode.
    pub fn size_depends_on_mode(&self) -> Result<bool, AsmError> {
        Ok(self.size(true)? != self.size(false)?)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Bits32(true) => write!(f, "bits 32"),
            Instruction::Bits32(false) => write!(f, "bits 16"),
            Instruction::Org(v) => write!(f, "org 0x{:X}", v),
            Instruction::Align(v) => write!(f, "align {}", v),
            Instruction::Times { length, fill } => write!(f, "times {} db 0x{:02X}", length, fill),
            Instruction::Offset(v) => write!(f, "offset 0x{:X}", v),
            Instruction::Label(name) => write!(f, "{}:", name),
            Instruction::Data { label, value } => {
                if let Some(label) = label {
                    write!(f, "{}: ", label)?;
                }
                match value {
                    DataValue::Bytes(bytes) => {
                        f.write_str("db ")?;
                        for (i, b) in bytes.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "0x{:02X}", b)?;
                        }
                        Ok(())
                    }
                    DataValue::Word(w) => write!(f, "dw 0x{:04X}", w),
                    DataValue::Dword(d) => write!(f, "dd 0x{:08X}", d),
                    DataValue::Address(l) => write!(f, "dd {}", l),
                }
            }
            Instruction::Machine(m) => write!(f, "{}", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn register_codes_and_sizes() {
        assert_eq!(Register::Edi.base_code(), 7);
        assert_eq!(Register::Ah.base_code(), 4);
        assert_eq!(Register::Ds.base_code(), 3);
        assert_eq!(Register::Bx.size_bits(), 16);
        assert_eq!(Register::Gs.size_bits(), 16);
        assert!(Register::Fs.is_segment());
        assert!(!Register::Esp.is_segment());
    }

    #[test]
    fn condition_codes() {
        assert_eq!(Condition::O.code(), 0x0);
        assert_eq!(Condition::E.code(), 0x4);
        assert_eq!(Condition::Ne.code(), 0x5);
        assert_eq!(Condition::G.code(), 0xF);
    }

    #[test]
    fn memory_display() {
        let mem = MemoryOperand::dword(Register::Esp).disp(12);
        assert_eq!(mem.to_string(), "dword [esp+12]");

        let mem = MemoryOperand::byte(Register::Ebx)
            .segment(Register::Fs)
            .index(Register::Esi, 4)
            .disp(-8);
        assert_eq!(mem.to_string(), "byte [fs:ebx+esi*4-8]");

        let mem = MemoryOperand::label(OperandSize::Word, "counter");
        assert_eq!(mem.to_string(), "word [counter]");

        let mem = MemoryOperand::absolute(OperandSize::Dword, 0xB8000);
        assert_eq!(mem.to_string(), "dword [0xB8000]");
    }

    #[test]
    fn address_size_follows_registers() {
        let m32 = MemoryOperand::dword(Register::Ebx);
        assert_eq!(m32.address_size(false).unwrap(), 32);
        let m16 = MemoryOperand::word(Register::Bx).index(Register::Si, 1);
        assert_eq!(m16.address_size(true).unwrap(), 16);
        let abs = MemoryOperand::absolute(OperandSize::Dword, 0x1000);
        assert_eq!(abs.address_size(true).unwrap(), 32);
        assert_eq!(abs.address_size(false).unwrap(), 16);
    }

    #[test]
    fn address_size_rejects_mixed_widths() {
        let mixed = MemoryOperand::dword(Register::Ebx).index(Register::Si, 1);
        assert!(matches!(
            mixed.address_size(true),
            Err(AsmError::Unsupported { .. })
        ));
        let byte_base = MemoryOperand::dword(Register::Al);
        assert!(byte_base.address_size(true).is_err());
    }

    #[test]
    fn references_are_classified() {
        let jmp = Instruction::machine(Mnemonic::Jmp, vec![Operand::label("loop")]);
        assert_eq!(
            jmp.reference(),
            Some(Reference {
                label: "loop",
                kind: RefKind::Relative
            })
        );
        assert!(jmp.is_relative());

        let mov = Instruction::machine(
            Mnemonic::Mov,
            vec![Register::Esp.into(), Operand::label("stack_top")],
        );
        assert_eq!(mov.reference().map(|r| r.kind), Some(RefKind::Absolute));
        assert!(!mov.is_relative());

        let dd = Instruction::Data {
            label: None,
            value: DataValue::Address("end".into()),
        };
        assert_eq!(dd.reference().map(|r| r.label), Some("end"));

        let nop = Instruction::machine(Mnemonic::Nop, vec![]);
        assert!(nop.reference().is_none());
    }

    #[test]
    fn labels_match_case_insensitively() {
        let label = Instruction::Label("Kernel.Main".into());
        assert!(label.defines("kernel.main"));
        assert!(!label.defines("kernel"));
        let data = Instruction::Data {
            label: Some("msg".into()),
            value: DataValue::Bytes(vec![0]),
        };
        assert_eq!(data.label(), Some("msg"));
    }

    #[test]
    fn instruction_display() {
        let i = Instruction::machine(
            Mnemonic::Mov,
            vec![
                Register::Ecx.into(),
                MemoryOperand::dword(Register::Esp).disp(12).into(),
            ],
        );
        assert_eq!(i.to_string(), "mov ecx, dword [esp+12]");
        let j = Instruction::machine(Mnemonic::Jcc(Condition::Ne), vec!["top".into()]);
        assert_eq!(j.to_string(), "jne top");
        assert_eq!(j.name(), "jne");
        assert_eq!(
            Instruction::Times {
                length: 8192,
                fill: 0
            }
            .to_string(),
            "times 8192 db 0x00"
        );
    }
}
