//! x86 (16/32-bit) instruction encoder.
//!
//! Encodes one [`Machine`] instruction at a time into machine-code bytes.
//! The linker supplies the resolved values through an [`EncodeCtx`]; with no
//! resolved values the encoder still produces the final length, because
//! symbolic displacements and label immediates always use their widest form.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::AsmError;
use crate::ir::*;

// ─── InstrBytes: stack-allocated instruction buffer ────────────────────

/// Stack-allocated instruction byte buffer.
///
/// x86 instructions are at most 15 bytes, so every encoding fits without
/// touching the heap.
#[derive(Clone)]
pub struct InstrBytes {
    data: [u8; 16],
    len: u8,
}

impl InstrBytes {
    /// Create an empty buffer.
    #[inline]
    pub const fn new() -> Self {
        Self {
            data: [0; 16],
            len: 0,
        }
    }

    /// Append a single byte.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!(
            (self.len as usize) < 16,
            "InstrBytes overflow: cannot push beyond 16 bytes"
        );
        self.data[self.len as usize] = byte;
        self.len += 1;
    }

    /// Append a slice of bytes.
    ///
    /// # Panics
    ///
    /// Panics if appending would exceed the 16-byte capacity.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.len as usize;
        let end = start + bytes.len();
        assert!(
            end <= 16,
            "InstrBytes overflow: {} + {} exceeds 16-byte capacity",
            start,
            bytes.len()
        );
        self.data[start..end].copy_from_slice(bytes);
        self.len = end as u8;
    }

    /// Number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Convert to a heap-allocated `Vec<u8>`.
    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

impl Default for InstrBytes {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for InstrBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl AsRef<[u8]> for InstrBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl core::fmt::Debug for InstrBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for InstrBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for InstrBytes {}

impl PartialEq<[u8]> for InstrBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

// ─── Encoding context ──────────────────────────────────────

/// Everything the encoder needs to know about an instruction's position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeCtx {
    /// `true` for 32-bit mode, `false` for 16-bit mode.
    pub bits32: bool,
    /// Form of a relative branch.
    pub form: BranchForm,
    /// Image offset of the first byte of the instruction.
    pub offset: u64,
    /// Resolved reference: the target's image offset for relative branches,
    /// the absolute address for label immediates. `None` while sizing.
    pub target: Option<i64>,
    /// Resolved absolute address of a symbolic memory displacement.
    pub mem_disp: Option<i64>,
}

impl EncodeCtx {
    /// Context for sizing an instruction in the given mode.
    pub fn sizing(bits32: bool, form: BranchForm) -> Self {
        Self {
            bits32,
            form,
            ..Self::default()
        }
    }

    #[inline]
    fn mode_bits(&self) -> u8 {
        if self.bits32 {
            32
        } else {
            16
        }
    }
}

/// Encoded length of any stream entry, sized without resolved values.
///
/// `Align` and `Offset` depend on the cursor position and report zero.
pub fn encoded_len(instr: &Instruction, bits32: bool, form: BranchForm) -> Result<u64, AsmError> {
    Ok(match instr {
        Instruction::Bits32(_)
        | Instruction::Org(_)
        | Instruction::Align(_)
        | Instruction::Offset(_)
        | Instruction::Label(_) => 0,
        Instruction::Times { length, .. } => u64::from(*length),
        Instruction::Data { value, .. } => value.len() as u64,
        Instruction::Machine(m) => encode_machine(m, &EncodeCtx::sizing(bits32, form))?.len() as u64,
    })
}

/// Encode a single machine instruction.
pub fn encode_machine(m: &Machine, cx: &EncodeCtx) -> Result<InstrBytes, AsmError> {
    let mut buf = InstrBytes::new();
    let ops = m.operands.as_slice();
    match m.mnemonic {
        Mnemonic::Mov => encode_mov(&mut buf, cx, m, ops)?,
        Mnemonic::Movzx => encode_movx(&mut buf, cx, m, ops, 0xB6)?,
        Mnemonic::Movsx => encode_movx(&mut buf, cx, m, ops, 0xBE)?,
        Mnemonic::Lea => encode_lea(&mut buf, cx, m, ops)?,
        Mnemonic::Add => encode_alu(&mut buf, cx, m, ops, 0)?,
        Mnemonic::Or => encode_alu(&mut buf, cx, m, ops, 1)?,
        Mnemonic::Adc => encode_alu(&mut buf, cx, m, ops, 2)?,
        Mnemonic::Sbb => encode_alu(&mut buf, cx, m, ops, 3)?,
        Mnemonic::And => encode_alu(&mut buf, cx, m, ops, 4)?,
        Mnemonic::Sub => encode_alu(&mut buf, cx, m, ops, 5)?,
        Mnemonic::Xor => encode_alu(&mut buf, cx, m, ops, 6)?,
        Mnemonic::Cmp => encode_alu(&mut buf, cx, m, ops, 7)?,
        Mnemonic::Test => encode_test(&mut buf, cx, m, ops)?,
        Mnemonic::Not => encode_unary(&mut buf, cx, m, ops, 2)?,
        Mnemonic::Neg => encode_unary(&mut buf, cx, m, ops, 3)?,
        Mnemonic::Mul => encode_unary(&mut buf, cx, m, ops, 4)?,
        Mnemonic::Imul => encode_imul(&mut buf, cx, m, ops)?,
        Mnemonic::Div => encode_unary(&mut buf, cx, m, ops, 6)?,
        Mnemonic::Idiv => encode_unary(&mut buf, cx, m, ops, 7)?,
        Mnemonic::Inc => encode_inc_dec(&mut buf, cx, m, ops, 0)?,
        Mnemonic::Dec => encode_inc_dec(&mut buf, cx, m, ops, 1)?,
        Mnemonic::Rol => encode_shift(&mut buf, cx, m, ops, 0)?,
        Mnemonic::Ror => encode_shift(&mut buf, cx, m, ops, 1)?,
        Mnemonic::Shl => encode_shift(&mut buf, cx, m, ops, 4)?,
        Mnemonic::Shr => encode_shift(&mut buf, cx, m, ops, 5)?,
        Mnemonic::Sar => encode_shift(&mut buf, cx, m, ops, 7)?,
        Mnemonic::Push => encode_push(&mut buf, cx, m, ops)?,
        Mnemonic::Pop => encode_pop(&mut buf, cx, m, ops)?,
        Mnemonic::Call => encode_call(&mut buf, cx, m, ops)?,
        Mnemonic::Jmp => encode_jmp(&mut buf, cx, m, ops)?,
        Mnemonic::Jcc(cc) => encode_jcc(&mut buf, cx, m, ops, cc)?,
        Mnemonic::Setcc(cc) => encode_setcc(&mut buf, cx, m, ops, cc)?,
        Mnemonic::Ret => encode_ret(&mut buf, m, ops)?,
        Mnemonic::Int => encode_int(&mut buf, m, ops)?,
        Mnemonic::Xchg => encode_xchg(&mut buf, cx, m, ops)?,
        Mnemonic::In => encode_in(&mut buf, cx, m, ops)?,
        Mnemonic::Out => encode_out(&mut buf, cx, m, ops)?,
        Mnemonic::Lgdt => encode_descriptor_table(&mut buf, cx, m, ops, 2)?,
        Mnemonic::Lidt => encode_descriptor_table(&mut buf, cx, m, ops, 3)?,
        Mnemonic::Nop => encode_fixed(&mut buf, cx, m, ops, 0x90, None)?,
        Mnemonic::Hlt => encode_fixed(&mut buf, cx, m, ops, 0xF4, None)?,
        Mnemonic::Cli => encode_fixed(&mut buf, cx, m, ops, 0xFA, None)?,
        Mnemonic::Sti => encode_fixed(&mut buf, cx, m, ops, 0xFB, None)?,
        Mnemonic::Cld => encode_fixed(&mut buf, cx, m, ops, 0xFC, None)?,
        Mnemonic::Std => encode_fixed(&mut buf, cx, m, ops, 0xFD, None)?,
        Mnemonic::Leave => encode_fixed(&mut buf, cx, m, ops, 0xC9, None)?,
        Mnemonic::Int3 => encode_fixed(&mut buf, cx, m, ops, 0xCC, None)?,
        Mnemonic::Iret => encode_fixed(&mut buf, cx, m, ops, 0xCF, Some(32))?,
        Mnemonic::Pushad => encode_fixed(&mut buf, cx, m, ops, 0x60, Some(32))?,
        Mnemonic::Popad => encode_fixed(&mut buf, cx, m, ops, 0x61, Some(32))?,
        Mnemonic::Pushfd => encode_fixed(&mut buf, cx, m, ops, 0x9C, Some(32))?,
        Mnemonic::Popfd => encode_fixed(&mut buf, cx, m, ops, 0x9D, Some(32))?,
        Mnemonic::Cdq => encode_fixed(&mut buf, cx, m, ops, 0x99, Some(32))?,
    }
    Ok(buf)
}

// ─── Shared helpers ────────────────────────────────────────

/// Build ModR/M byte.
#[inline]
pub(crate) fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Build SIB byte.
#[inline]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    let ss = match scale {
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 0,
    };
    (ss << 6) | ((index & 7) << 3) | (base & 7)
}

fn invalid(m: &Machine, detail: &str) -> AsmError {
    AsmError::InvalidOperands {
        mnemonic: format!("{}", m.mnemonic),
        detail: String::from(detail),
    }
}

/// Operand width of a general-purpose register.
fn gp_size(m: &Machine, reg: Register) -> Result<u8, AsmError> {
    if reg.is_segment() {
        return Err(invalid(m, "segment register not allowed here"));
    }
    Ok(reg.size_bits())
}

/// Operand width of a memory access that carries its own size.
fn mem_size(m: &Machine, mem: &MemoryOperand) -> Result<u8, AsmError> {
    match mem.size {
        OperandSize::Byte => Ok(8),
        OperandSize::Word => Ok(16),
        OperandSize::Dword => Ok(32),
        OperandSize::Qword | OperandSize::Tword => Err(AsmError::unsupported(format!("{}", m))),
    }
}

/// Emit the operand-size override when `size` differs from the mode.
#[inline]
fn operand_size_prefix(buf: &mut InstrBytes, cx: &EncodeCtx, size: u8) {
    if (size == 16 && cx.bits32) || (size == 32 && !cx.bits32) {
        buf.push(0x66);
    }
}

/// Emit segment override, address-size override, and operand-size override,
/// in that order.
fn emit_prefixes(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    size: u8,
    mem: Option<&MemoryOperand>,
) -> Result<(), AsmError> {
    if let Some(mem) = mem {
        if let Some(seg) = mem.segment {
            let prefix = seg.segment_prefix().ok_or_else(|| {
                AsmError::unsupported(format!("'{}' as a segment override", seg))
            })?;
            buf.push(prefix);
        }
        if mem.address_size(cx.bits32)? != cx.mode_bits() {
            buf.push(0x67);
        }
    }
    operand_size_prefix(buf, cx, size);
    Ok(())
}

/// Emit ModR/M (and SIB and displacement) for a memory operand.
pub(crate) fn emit_mem_modrm(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    reg_field: u8,
    mem: &MemoryOperand,
) -> Result<(), AsmError> {
    let (disp, forced) = match &mem.displacement {
        Displacement::Literal(d) => (i64::from(*d), false),
        Displacement::Label { .. } => (cx.mem_disp.unwrap_or(0), true),
    };
    if mem.index.is_some() && !matches!(mem.scale, 1 | 2 | 4 | 8) {
        return Err(AsmError::unsupported(format!("scale {} in '{}'", mem.scale, mem)));
    }
    if mem.address_size(cx.bits32)? == 32 {
        emit_mem32(buf, reg_field, mem, disp, forced)
    } else {
        emit_mem16(buf, reg_field, mem, disp, forced)
    }
}

fn emit_disp32(buf: &mut InstrBytes, disp: i64) -> Result<(), AsmError> {
    if !(i64::from(i32::MIN)..=i64::from(u32::MAX)).contains(&disp) {
        return Err(AsmError::ImmediateOverflow {
            value: disp,
            bits: 32,
        });
    }
    buf.extend_from_slice(&(disp as u32).to_le_bytes());
    Ok(())
}

fn emit_disp16(buf: &mut InstrBytes, disp: i64) -> Result<(), AsmError> {
    if !(i64::from(i16::MIN)..=i64::from(u16::MAX)).contains(&disp) {
        return Err(AsmError::ImmediateOverflow {
            value: disp,
            bits: 16,
        });
    }
    buf.extend_from_slice(&(disp as u16).to_le_bytes());
    Ok(())
}

fn emit_mem32(
    buf: &mut InstrBytes,
    reg_field: u8,
    mem: &MemoryOperand,
    disp: i64,
    forced: bool,
) -> Result<(), AsmError> {
    if mem.index == Some(Register::Esp) {
        return Err(AsmError::unsupported(format!("'{}' (esp cannot be an index)", mem)));
    }

    let base = match (mem.base, mem.index) {
        // [disp32]
        (None, None) => {
            buf.push(modrm(0b00, reg_field, 0b101));
            return emit_disp32(buf, disp);
        }
        // [index*scale + disp32]: SIB with no base
        (None, Some(idx)) => {
            buf.push(modrm(0b00, reg_field, 0b100));
            buf.push(sib(mem.scale, idx.base_code(), 0b101));
            return emit_disp32(buf, disp);
        }
        (Some(base), _) => base,
    };

    // ESP as base needs a SIB byte; EBP with no displacement needs disp8.
    let need_sib = mem.index.is_some() || base.base_code() == 4;
    let mod_bits = if !forced && disp == 0 && base.base_code() != 5 {
        0b00
    } else if !forced && (-128..=127).contains(&disp) {
        0b01
    } else {
        0b10
    };

    if need_sib {
        let idx = mem.index.map_or(0b100, Register::base_code);
        buf.push(modrm(mod_bits, reg_field, 0b100));
        buf.push(sib(mem.scale, idx, base.base_code()));
    } else {
        buf.push(modrm(mod_bits, reg_field, base.base_code()));
    }

    match mod_bits {
        0b01 => {
            buf.push(disp as i8 as u8);
            Ok(())
        }
        0b10 => emit_disp32(buf, disp),
        _ => Ok(()),
    }
}

fn emit_mem16(
    buf: &mut InstrBytes,
    reg_field: u8,
    mem: &MemoryOperand,
    disp: i64,
    forced: bool,
) -> Result<(), AsmError> {
    use Register::{Bp, Bx, Di, Si};

    if mem.index.is_some() && mem.scale != 1 {
        return Err(AsmError::unsupported(format!(
            "scaled index in 16-bit address '{}'",
            mem
        )));
    }

    let rm = match (mem.base, mem.index) {
        (None, None) => {
            buf.push(modrm(0b00, reg_field, 0b110));
            return emit_disp16(buf, disp);
        }
        (Some(Bx), Some(Si)) | (Some(Si), Some(Bx)) => 0b000,
        (Some(Bx), Some(Di)) | (Some(Di), Some(Bx)) => 0b001,
        (Some(Bp), Some(Si)) | (Some(Si), Some(Bp)) => 0b010,
        (Some(Bp), Some(Di)) | (Some(Di), Some(Bp)) => 0b011,
        (Some(Si), None) | (None, Some(Si)) => 0b100,
        (Some(Di), None) | (None, Some(Di)) => 0b101,
        (Some(Bp), None) | (None, Some(Bp)) => 0b110,
        (Some(Bx), None) | (None, Some(Bx)) => 0b111,
        _ => {
            return Err(AsmError::unsupported(format!(
                "register combination in 16-bit address '{}'",
                mem
            )))
        }
    };

    // [bp] has no mod=00 form: it means [disp16].
    if !forced && disp == 0 && rm != 0b110 {
        buf.push(modrm(0b00, reg_field, rm));
        Ok(())
    } else if !forced && (-128..=127).contains(&disp) {
        buf.push(modrm(0b01, reg_field, rm));
        buf.push(disp as i8 as u8);
        Ok(())
    } else {
        buf.push(modrm(0b10, reg_field, rm));
        emit_disp16(buf, disp)
    }
}

/// An immediate operand. Label immediates are symbolic and always take the
/// widest encoding, so their length is known before resolution.
#[derive(Debug, Clone, Copy)]
struct Imm {
    value: i64,
    symbolic: bool,
}

impl Imm {
    #[inline]
    fn fits_i8(self) -> bool {
        !self.symbolic && (-128..=127).contains(&self.value)
    }
}

fn immediate(cx: &EncodeCtx, op: &Operand) -> Option<Imm> {
    match op {
        Operand::Immediate(v) => Some(Imm {
            value: *v,
            symbolic: false,
        }),
        Operand::Label(_) => Some(Imm {
            value: cx.target.unwrap_or(0),
            symbolic: true,
        }),
        _ => None,
    }
}

/// Write an immediate of `bits` width; accepts signed or unsigned values.
fn emit_imm(buf: &mut InstrBytes, value: i64, bits: u8) -> Result<(), AsmError> {
    let (lo, hi) = match bits {
        8 => (i64::from(i8::MIN), i64::from(u8::MAX)),
        16 => (i64::from(i16::MIN), i64::from(u16::MAX)),
        _ => (i64::from(i32::MIN), i64::from(u32::MAX)),
    };
    if !(lo..=hi).contains(&value) {
        return Err(AsmError::ImmediateOverflow { value, bits });
    }
    match bits {
        8 => buf.push(value as u8),
        16 => buf.extend_from_slice(&(value as u16).to_le_bytes()),
        _ => buf.extend_from_slice(&(value as u32).to_le_bytes()),
    }
    Ok(())
}

/// Register-to-register ModR/M form: `opcode /r` with `reg` in the reg
/// field and `rm` in the r/m field.
fn emit_rr(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    opcode: &[u8],
    rm: Register,
    reg: Register,
) -> Result<(), AsmError> {
    let size = gp_size(m, rm)?;
    if gp_size(m, reg)? != size {
        return Err(invalid(m, "operand sizes do not match"));
    }
    operand_size_prefix(buf, cx, size);
    buf.extend_from_slice(opcode);
    buf.push(modrm(0b11, reg.base_code(), rm.base_code()));
    Ok(())
}

/// `opcode /digit` on a register.
fn emit_digit_reg(buf: &mut InstrBytes, cx: &EncodeCtx, opcode: &[u8], digit: u8, reg: Register, size: u8) {
    operand_size_prefix(buf, cx, size);
    buf.extend_from_slice(opcode);
    buf.push(modrm(0b11, digit, reg.base_code()));
}

/// `opcode /digit` (or `/r`) on a memory operand.
fn emit_digit_mem(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    opcode: &[u8],
    digit: u8,
    mem: &MemoryOperand,
    size: u8,
) -> Result<(), AsmError> {
    emit_prefixes(buf, cx, size, Some(mem))?;
    buf.extend_from_slice(opcode);
    emit_mem_modrm(buf, cx, digit, mem)
}

#[inline]
fn by_size(size: u8, byte_op: u8, full_op: u8) -> u8 {
    if size == 8 {
        byte_op
    } else {
        full_op
    }
}

// ─── Data movement ─────────────────────────────────────────

fn encode_mov(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [dst, src] = ops else {
        return Err(invalid(m, "expected 2 operands"));
    };

    match (dst, src) {
        // mov sreg, r16/r32
        (Operand::Register(sreg), Operand::Register(src)) if sreg.is_segment() => {
            if src.size_bits() == 8 || src.is_segment() {
                return Err(invalid(m, "segment register source must be a 16/32-bit register"));
            }
            buf.push(0x8E);
            buf.push(modrm(0b11, sreg.base_code(), src.base_code()));
        }
        // mov r16/r32, sreg
        (Operand::Register(dst), Operand::Register(sreg)) if sreg.is_segment() => {
            let size = gp_size(m, *dst)?;
            if size == 8 {
                return Err(invalid(m, "segment register destination must be 16/32-bit"));
            }
            operand_size_prefix(buf, cx, size);
            buf.push(0x8C);
            buf.push(modrm(0b11, sreg.base_code(), dst.base_code()));
        }
        (Operand::Register(dst), Operand::Register(src)) => {
            let opcode = by_size(gp_size(m, *dst)?, 0x88, 0x89);
            emit_rr(buf, cx, m, &[opcode], *dst, *src)?;
        }
        // mov sreg, [mem]
        (Operand::Register(sreg), Operand::Memory(mem)) if sreg.is_segment() => {
            emit_digit_mem(buf, cx, &[0x8E], sreg.base_code(), mem, 0)?;
        }
        (Operand::Register(dst), Operand::Memory(mem)) => {
            let size = gp_size(m, *dst)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0x8A, 0x8B)], dst.base_code(), mem, size)?;
        }
        // mov [mem], sreg
        (Operand::Memory(mem), Operand::Register(sreg)) if sreg.is_segment() => {
            emit_digit_mem(buf, cx, &[0x8C], sreg.base_code(), mem, 0)?;
        }
        (Operand::Memory(mem), Operand::Register(src)) => {
            let size = gp_size(m, *src)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0x88, 0x89)], src.base_code(), mem, size)?;
        }
        (Operand::Register(dst), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = gp_size(m, *dst)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            operand_size_prefix(buf, cx, size);
            buf.push(by_size(size, 0xB0, 0xB8) + dst.base_code());
            emit_imm(buf, imm.value, size)?;
        }
        (Operand::Memory(mem), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = mem_size(m, mem)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            emit_digit_mem(buf, cx, &[by_size(size, 0xC6, 0xC7)], 0, mem, size)?;
            emit_imm(buf, imm.value, size)?;
        }
        _ => return Err(invalid(m, "unsupported operand combination")),
    }
    Ok(())
}

/// `movzx` / `movsx`: `0F B6/BE` from 8-bit, `0F B7/BF` from 16-bit.
fn encode_movx(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    opcode8: u8,
) -> Result<(), AsmError> {
    let [Operand::Register(dst), src] = ops else {
        return Err(invalid(m, "expected a register destination and a source"));
    };
    let dst_size = gp_size(m, *dst)?;
    let src_size = match src {
        Operand::Register(r) => gp_size(m, *r)?,
        Operand::Memory(mem) => mem_size(m, mem)?,
        _ => return Err(invalid(m, "source must be a register or memory")),
    };
    if src_size >= dst_size {
        return Err(invalid(m, "source must be narrower than the destination"));
    }
    let opcode = [0x0F, if src_size == 8 { opcode8 } else { opcode8 + 1 }];
    match src {
        Operand::Register(r) => {
            operand_size_prefix(buf, cx, dst_size);
            buf.extend_from_slice(&opcode);
            buf.push(modrm(0b11, dst.base_code(), r.base_code()));
            Ok(())
        }
        Operand::Memory(mem) => emit_digit_mem(buf, cx, &opcode, dst.base_code(), mem, dst_size),
        _ => Err(invalid(m, "source must be a register or memory")),
    }
}

fn encode_lea(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [Operand::Register(dst), Operand::Memory(mem)] = ops else {
        return Err(invalid(m, "expected register, memory"));
    };
    let size = gp_size(m, *dst)?;
    if size == 8 {
        return Err(invalid(m, "destination must be 16/32-bit"));
    }
    emit_digit_mem(buf, cx, &[0x8D], dst.base_code(), mem, size)
}

fn encode_xchg(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [a, b] = ops else {
        return Err(invalid(m, "expected 2 operands"));
    };
    match (a, b) {
        (Operand::Register(a), Operand::Register(b)) => {
            let size = gp_size(m, *a)?;
            if gp_size(m, *b)? != size {
                return Err(invalid(m, "operand sizes do not match"));
            }
            // Accumulator short form: 90+r
            if size != 8 && (a.base_code() == 0 || b.base_code() == 0) {
                let other = if a.base_code() == 0 { *b } else { *a };
                operand_size_prefix(buf, cx, size);
                buf.push(0x90 + other.base_code());
            } else {
                emit_rr(buf, cx, m, &[by_size(size, 0x86, 0x87)], *a, *b)?;
            }
            Ok(())
        }
        (Operand::Register(r), Operand::Memory(mem)) | (Operand::Memory(mem), Operand::Register(r)) => {
            let size = gp_size(m, *r)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0x86, 0x87)], r.base_code(), mem, size)
        }
        _ => Err(invalid(m, "unsupported operand combination")),
    }
}

// ─── Arithmetic and logic ──────────────────────────────────

fn encode_alu(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    alu_num: u8,
) -> Result<(), AsmError> {
    let [dst, src] = ops else {
        return Err(invalid(m, "expected 2 operands"));
    };

    match (dst, src) {
        // r/m, r
        (Operand::Register(dst), Operand::Register(src)) => {
            let opcode = by_size(gp_size(m, *dst)?, alu_num * 8, alu_num * 8 + 1);
            emit_rr(buf, cx, m, &[opcode], *dst, *src)
        }
        // r, [mem]
        (Operand::Register(dst), Operand::Memory(mem)) => {
            let size = gp_size(m, *dst)?;
            let opcode = by_size(size, alu_num * 8 + 2, alu_num * 8 + 3);
            emit_digit_mem(buf, cx, &[opcode], dst.base_code(), mem, size)
        }
        // [mem], r
        (Operand::Memory(mem), Operand::Register(src)) => {
            let size = gp_size(m, *src)?;
            let opcode = by_size(size, alu_num * 8, alu_num * 8 + 1);
            emit_digit_mem(buf, cx, &[opcode], src.base_code(), mem, size)
        }
        // r, imm
        (Operand::Register(dst), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = gp_size(m, *dst)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            encode_alu_reg_imm(buf, cx, *dst, size, imm, alu_num)
        }
        // [mem], imm
        (Operand::Memory(mem), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = mem_size(m, mem)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            if size == 8 {
                emit_digit_mem(buf, cx, &[0x80], alu_num, mem, size)?;
                emit_imm(buf, imm.value, 8)
            } else if imm.fits_i8() {
                emit_digit_mem(buf, cx, &[0x83], alu_num, mem, size)?;
                emit_imm(buf, imm.value, 8)
            } else {
                emit_digit_mem(buf, cx, &[0x81], alu_num, mem, size)?;
                emit_imm(buf, imm.value, size)
            }
        }
        _ => Err(invalid(m, "unsupported operand combination")),
    }
}

fn encode_alu_reg_imm(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    dst: Register,
    size: u8,
    imm: Imm,
    alu_num: u8,
) -> Result<(), AsmError> {
    if size == 8 {
        // Special case: al, imm8 (short form)
        if dst == Register::Al {
            buf.push(alu_num * 8 + 4);
        } else {
            buf.push(0x80);
            buf.push(modrm(0b11, alu_num, dst.base_code()));
        }
        return emit_imm(buf, imm.value, 8);
    }

    operand_size_prefix(buf, cx, size);
    if imm.fits_i8() {
        // Sign-extended imm8
        buf.push(0x83);
        buf.push(modrm(0b11, alu_num, dst.base_code()));
        emit_imm(buf, imm.value, 8)
    } else {
        // Special case: ax/eax can use shorter opcode
        if dst.base_code() == 0 {
            buf.push(alu_num * 8 + 5);
        } else {
            buf.push(0x81);
            buf.push(modrm(0b11, alu_num, dst.base_code()));
        }
        emit_imm(buf, imm.value, size)
    }
}

fn encode_test(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [dst, src] = ops else {
        return Err(invalid(m, "expected 2 operands"));
    };
    match (dst, src) {
        (Operand::Register(dst), Operand::Register(src)) => {
            let opcode = by_size(gp_size(m, *dst)?, 0x84, 0x85);
            emit_rr(buf, cx, m, &[opcode], *dst, *src)
        }
        (Operand::Memory(mem), Operand::Register(r)) | (Operand::Register(r), Operand::Memory(mem)) => {
            let size = gp_size(m, *r)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0x84, 0x85)], r.base_code(), mem, size)
        }
        (Operand::Register(dst), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = gp_size(m, *dst)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            operand_size_prefix(buf, cx, size);
            if dst.base_code() == 0 {
                buf.push(by_size(size, 0xA8, 0xA9));
            } else {
                buf.push(by_size(size, 0xF6, 0xF7));
                buf.push(modrm(0b11, 0, dst.base_code()));
            }
            emit_imm(buf, imm.value, size)
        }
        (Operand::Memory(mem), imm @ (Operand::Immediate(_) | Operand::Label(_))) => {
            let size = mem_size(m, mem)?;
            let imm = immediate(cx, imm).ok_or_else(|| invalid(m, "expected an immediate"))?;
            emit_digit_mem(buf, cx, &[by_size(size, 0xF6, 0xF7)], 0, mem, size)?;
            emit_imm(buf, imm.value, size)
        }
        _ => Err(invalid(m, "unsupported operand combination")),
    }
}

/// `F6/F7 /digit`: not, neg, mul, imul (one operand), div, idiv.
fn encode_unary(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    digit: u8,
) -> Result<(), AsmError> {
    match ops {
        [Operand::Register(r)] => {
            let size = gp_size(m, *r)?;
            emit_digit_reg(buf, cx, &[by_size(size, 0xF6, 0xF7)], digit, *r, size);
            Ok(())
        }
        [Operand::Memory(mem)] => {
            let size = mem_size(m, mem)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0xF6, 0xF7)], digit, mem, size)
        }
        _ => Err(invalid(m, "expected one register or memory operand")),
    }
}

fn encode_imul(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [_] => encode_unary(buf, cx, m, ops, 5),
        // imul r, r/m
        [Operand::Register(dst), src] => {
            let size = gp_size(m, *dst)?;
            if size == 8 {
                return Err(invalid(m, "destination must be 16/32-bit"));
            }
            match src {
                Operand::Register(r) => emit_rr(buf, cx, m, &[0x0F, 0xAF], *r, *dst),
                Operand::Memory(mem) => emit_digit_mem(buf, cx, &[0x0F, 0xAF], dst.base_code(), mem, size),
                _ => Err(invalid(m, "source must be a register or memory")),
            }
        }
        // imul r, r/m, imm
        [Operand::Register(dst), src, Operand::Immediate(v)] => {
            let size = gp_size(m, *dst)?;
            if size == 8 {
                return Err(invalid(m, "destination must be 16/32-bit"));
            }
            let imm = Imm {
                value: *v,
                symbolic: false,
            };
            let opcode = if imm.fits_i8() { 0x6B } else { 0x69 };
            match src {
                Operand::Register(r) => emit_rr(buf, cx, m, &[opcode], *r, *dst)?,
                Operand::Memory(mem) => emit_digit_mem(buf, cx, &[opcode], dst.base_code(), mem, size)?,
                _ => return Err(invalid(m, "source must be a register or memory")),
            }
            emit_imm(buf, imm.value, if imm.fits_i8() { 8 } else { size })
        }
        _ => Err(invalid(m, "unsupported operand combination")),
    }
}

fn encode_inc_dec(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    digit: u8,
) -> Result<(), AsmError> {
    match ops {
        [Operand::Register(r)] => {
            let size = gp_size(m, *r)?;
            if size == 8 {
                emit_digit_reg(buf, cx, &[0xFE], digit, *r, size);
            } else {
                // 40+r / 48+r
                operand_size_prefix(buf, cx, size);
                buf.push(0x40 + digit * 8 + r.base_code());
            }
            Ok(())
        }
        [Operand::Memory(mem)] => {
            let size = mem_size(m, mem)?;
            emit_digit_mem(buf, cx, &[by_size(size, 0xFE, 0xFF)], digit, mem, size)
        }
        _ => Err(invalid(m, "expected one register or memory operand")),
    }
}

/// Shift/rotate group: `D0/D1` by one, `C0/C1 ib` by immediate, `D2/D3` by CL.
fn encode_shift(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    digit: u8,
) -> Result<(), AsmError> {
    let [dst, count] = ops else {
        return Err(invalid(m, "expected 2 operands"));
    };
    let size = match dst {
        Operand::Register(r) => gp_size(m, *r)?,
        Operand::Memory(mem) => mem_size(m, mem)?,
        _ => return Err(invalid(m, "destination must be a register or memory")),
    };

    let (opcode, imm) = match count {
        Operand::Register(Register::Cl) => (by_size(size, 0xD2, 0xD3), None),
        Operand::Immediate(1) => (by_size(size, 0xD0, 0xD1), None),
        Operand::Immediate(v) => {
            if !(0..=255).contains(v) {
                return Err(AsmError::ImmediateOverflow { value: *v, bits: 8 });
            }
            (by_size(size, 0xC0, 0xC1), Some(*v))
        }
        _ => return Err(invalid(m, "shift count must be CL or an immediate")),
    };

    match dst {
        Operand::Register(r) => emit_digit_reg(buf, cx, &[opcode], digit, *r, size),
        Operand::Memory(mem) => emit_digit_mem(buf, cx, &[opcode], digit, mem, size)?,
        _ => return Err(invalid(m, "destination must be a register or memory")),
    }
    if let Some(v) = imm {
        emit_imm(buf, v, 8)?;
    }
    Ok(())
}

fn encode_setcc(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    cc: Condition,
) -> Result<(), AsmError> {
    let opcode = [0x0F, 0x90 + cc.code()];
    match ops {
        [Operand::Register(r)] if r.size_bits() == 8 && !r.is_segment() => {
            emit_digit_reg(buf, cx, &opcode, 0, *r, 8);
            Ok(())
        }
        [Operand::Memory(mem)] if mem.size == OperandSize::Byte => {
            emit_digit_mem(buf, cx, &opcode, 0, mem, 8)
        }
        _ => Err(invalid(m, "expected an 8-bit register or byte memory operand")),
    }
}

// ─── Stack ─────────────────────────────────────────────────

fn encode_push(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [op] = ops else {
        return Err(invalid(m, "expected 1 operand"));
    };
    match op {
        Operand::Register(r) if r.is_segment() => {
            match r {
                Register::Es => buf.push(0x06),
                Register::Cs => buf.push(0x0E),
                Register::Ss => buf.push(0x16),
                Register::Ds => buf.push(0x1E),
                Register::Fs => buf.extend_from_slice(&[0x0F, 0xA0]),
                _ => buf.extend_from_slice(&[0x0F, 0xA8]),
            }
            Ok(())
        }
        Operand::Register(r) => {
            let size = gp_size(m, *r)?;
            if size == 8 {
                return Err(invalid(m, "cannot push an 8-bit register"));
            }
            operand_size_prefix(buf, cx, size);
            buf.push(0x50 + r.base_code());
            Ok(())
        }
        Operand::Memory(mem) => {
            let size = mem_size(m, mem)?;
            if size == 8 {
                return Err(invalid(m, "cannot push a byte operand"));
            }
            emit_digit_mem(buf, cx, &[0xFF], 6, mem, size)
        }
        Operand::Immediate(_) | Operand::Label(_) => {
            let imm = immediate(cx, op).ok_or_else(|| invalid(m, "expected an immediate"))?;
            if imm.fits_i8() {
                buf.push(0x6A);
                emit_imm(buf, imm.value, 8)
            } else {
                buf.push(0x68);
                emit_imm(buf, imm.value, cx.mode_bits())
            }
        }
    }
}

fn encode_pop(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Register(r)] if r.is_segment() => {
            match r {
                Register::Es => buf.push(0x07),
                Register::Ss => buf.push(0x17),
                Register::Ds => buf.push(0x1F),
                Register::Fs => buf.extend_from_slice(&[0x0F, 0xA1]),
                Register::Gs => buf.extend_from_slice(&[0x0F, 0xA9]),
                _ => return Err(invalid(m, "cannot pop into cs")),
            }
            Ok(())
        }
        [Operand::Register(r)] => {
            let size = gp_size(m, *r)?;
            if size == 8 {
                return Err(invalid(m, "cannot pop an 8-bit register"));
            }
            operand_size_prefix(buf, cx, size);
            buf.push(0x58 + r.base_code());
            Ok(())
        }
        [Operand::Memory(mem)] => {
            let size = mem_size(m, mem)?;
            if size == 8 {
                return Err(invalid(m, "cannot pop a byte operand"));
            }
            emit_digit_mem(buf, cx, &[0x8F], 0, mem, size)
        }
        _ => Err(invalid(m, "expected one register or memory operand")),
    }
}

// ─── Control flow ──────────────────────────────────────────

/// Emit a relative branch. The displacement is measured from the end of the
/// instruction; `short` is the rel8 opcode, used only when the context
/// selects the short form.
fn emit_branch(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    label: &str,
    near: &[u8],
    short: Option<u8>,
) -> Result<(), AsmError> {
    let short = match cx.form {
        BranchForm::Short => short,
        BranchForm::Near => None,
    };
    let len = match short {
        Some(_) => 2,
        None => near.len() as u64 + if cx.bits32 { 4 } else { 2 },
    };
    let disp = cx
        .target
        .map_or(0, |target| target - (cx.offset + len) as i64);

    let max = match (short, cx.bits32) {
        (Some(_), _) => i64::from(i8::MAX),
        (None, false) => i64::from(i16::MAX),
        (None, true) => i64::from(i32::MAX),
    };
    if disp > max || disp < -max - 1 {
        return Err(AsmError::BranchOutOfRange {
            label: String::from(label),
            disp,
            max,
        });
    }

    match short {
        Some(opcode) => {
            buf.push(opcode);
            buf.push(disp as i8 as u8);
        }
        None => {
            buf.extend_from_slice(near);
            if cx.bits32 {
                buf.extend_from_slice(&(disp as i32).to_le_bytes());
            } else {
                buf.extend_from_slice(&(disp as i16).to_le_bytes());
            }
        }
    }
    Ok(())
}

/// Indirect branch through a register or memory: `FF /digit`.
fn emit_indirect(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    op: &Operand,
    digit: u8,
) -> Result<(), AsmError> {
    match op {
        Operand::Register(r) => {
            let size = gp_size(m, *r)?;
            if size == 8 {
                return Err(invalid(m, "branch target register must be 16/32-bit"));
            }
            emit_digit_reg(buf, cx, &[0xFF], digit, *r, size);
            Ok(())
        }
        Operand::Memory(mem) => {
            let size = match mem.size {
                OperandSize::Word => 16,
                OperandSize::Dword => 32,
                _ => return Err(invalid(m, "branch target memory must be word or dword")),
            };
            emit_digit_mem(buf, cx, &[0xFF], digit, mem, size)
        }
        _ => Err(invalid(m, "expected a label, register, or memory operand")),
    }
}

fn encode_jmp(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Label(label)] => emit_branch(buf, cx, label, &[0xE9], Some(0xEB)),
        [op] => emit_indirect(buf, cx, m, op, 4),
        _ => Err(invalid(m, "expected 1 operand")),
    }
}

fn encode_call(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [Operand::Label(label)] => emit_branch(buf, cx, label, &[0xE8], None),
        [op] => emit_indirect(buf, cx, m, op, 2),
        _ => Err(invalid(m, "expected 1 operand")),
    }
}

fn encode_jcc(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    cc: Condition,
) -> Result<(), AsmError> {
    let [Operand::Label(label)] = ops else {
        return Err(invalid(m, "expected a label operand"));
    };
    emit_branch(buf, cx, label, &[0x0F, 0x80 + cc.code()], Some(0x70 + cc.code()))
}

fn encode_ret(buf: &mut InstrBytes, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    match ops {
        [] => {
            buf.push(0xC3);
            Ok(())
        }
        [Operand::Immediate(v)] => {
            if !(0..=i64::from(u16::MAX)).contains(v) {
                return Err(AsmError::ImmediateOverflow { value: *v, bits: 16 });
            }
            buf.push(0xC2);
            emit_imm(buf, *v, 16)
        }
        _ => Err(invalid(m, "expected no operand or an imm16")),
    }
}

fn encode_int(buf: &mut InstrBytes, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [Operand::Immediate(v)] = ops else {
        return Err(invalid(m, "expected an imm8 vector"));
    };
    if !(0..=255).contains(v) {
        return Err(AsmError::ImmediateOverflow { value: *v, bits: 8 });
    }
    buf.push(0xCD);
    buf.push(*v as u8);
    Ok(())
}

// ─── Ports and system ──────────────────────────────────────

fn accumulator_size(m: &Machine, reg: Register) -> Result<u8, AsmError> {
    match reg {
        Register::Al => Ok(8),
        Register::Ax => Ok(16),
        Register::Eax => Ok(32),
        _ => Err(invalid(m, "data operand must be al, ax, or eax")),
    }
}

fn encode_in(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [Operand::Register(acc), port] = ops else {
        return Err(invalid(m, "expected accumulator, port"));
    };
    let size = accumulator_size(m, *acc)?;
    operand_size_prefix(buf, cx, size);
    match port {
        Operand::Immediate(p) => {
            buf.push(by_size(size, 0xE4, 0xE5));
            if !(0..=255).contains(p) {
                return Err(AsmError::ImmediateOverflow { value: *p, bits: 8 });
            }
            buf.push(*p as u8);
        }
        Operand::Register(Register::Dx) => buf.push(by_size(size, 0xEC, 0xED)),
        _ => return Err(invalid(m, "port must be an imm8 or dx")),
    }
    Ok(())
}

fn encode_out(buf: &mut InstrBytes, cx: &EncodeCtx, m: &Machine, ops: &[Operand]) -> Result<(), AsmError> {
    let [port, Operand::Register(acc)] = ops else {
        return Err(invalid(m, "expected port, accumulator"));
    };
    let size = accumulator_size(m, *acc)?;
    operand_size_prefix(buf, cx, size);
    match port {
        Operand::Immediate(p) => {
            buf.push(by_size(size, 0xE6, 0xE7));
            if !(0..=255).contains(p) {
                return Err(AsmError::ImmediateOverflow { value: *p, bits: 8 });
            }
            buf.push(*p as u8);
        }
        Operand::Register(Register::Dx) => buf.push(by_size(size, 0xEE, 0xEF)),
        _ => return Err(invalid(m, "port must be an imm8 or dx")),
    }
    Ok(())
}

/// `lgdt` / `lidt`: `0F 01 /2`, `0F 01 /3`.
fn encode_descriptor_table(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    digit: u8,
) -> Result<(), AsmError> {
    let [Operand::Memory(mem)] = ops else {
        return Err(invalid(m, "expected a memory operand"));
    };
    emit_digit_mem(buf, cx, &[0x0F, 0x01], digit, mem, 0)
}

/// Zero-operand instruction. `op_size` marks the 32-bit-operand forms, which
/// need `0x66` in 16-bit mode.
fn encode_fixed(
    buf: &mut InstrBytes,
    cx: &EncodeCtx,
    m: &Machine,
    ops: &[Operand],
    opcode: u8,
    op_size: Option<u8>,
) -> Result<(), AsmError> {
    if !ops.is_empty() {
        return Err(invalid(m, "expected no operands"));
    }
    if let Some(size) = op_size {
        operand_size_prefix(buf, cx, size);
    }
    buf.push(opcode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use Register::*;

    fn enc_with(cx: EncodeCtx, mnemonic: Mnemonic, ops: Vec<Operand>) -> Vec<u8> {
        encode_machine(&Machine::new(mnemonic, ops), &cx)
            .unwrap()
            .to_vec()
    }

    fn enc32(mnemonic: Mnemonic, ops: Vec<Operand>) -> Vec<u8> {
        enc_with(EncodeCtx::sizing(true, BranchForm::Near), mnemonic, ops)
    }

    fn enc16(mnemonic: Mnemonic, ops: Vec<Operand>) -> Vec<u8> {
        enc_with(EncodeCtx::sizing(false, BranchForm::Near), mnemonic, ops)
    }

    fn err32(mnemonic: Mnemonic, ops: Vec<Operand>) -> AsmError {
        encode_machine(
            &Machine::new(mnemonic, ops),
            &EncodeCtx::sizing(true, BranchForm::Near),
        )
        .unwrap_err()
    }

    #[test]
    fn instr_bytes_basics() {
        let mut b = InstrBytes::new();
        assert!(b.is_empty());
        b.push(0x0F);
        b.extend_from_slice(&[0x01, 0x15]);
        assert_eq!(b.len(), 3);
        assert_eq!(b, *[0x0F, 0x01, 0x15].as_slice());
    }

    #[test]
    fn mov_register_forms() {
        assert_eq!(enc32(Mnemonic::Mov, vec![Eax.into(), Ebx.into()]), [0x89, 0xD8]);
        assert_eq!(enc32(Mnemonic::Mov, vec![Al.into(), 5.into()]), [0xB0, 0x05]);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![Esp.into(), 0x0010_3000.into()]),
            [0xBC, 0x00, 0x30, 0x10, 0x00]
        );
        assert_eq!(enc32(Mnemonic::Mov, vec![Ds.into(), Ax.into()]), [0x8E, 0xD8]);
    }

    #[test]
    fn mov_operand_size_prefix_follows_mode() {
        assert_eq!(
            enc32(Mnemonic::Mov, vec![Ax.into(), 0x1234.into()]),
            [0x66, 0xB8, 0x34, 0x12]
        );
        assert_eq!(enc16(Mnemonic::Mov, vec![Ax.into(), 0x1234.into()]), [0xB8, 0x34, 0x12]);
        assert_eq!(
            enc16(Mnemonic::Mov, vec![Eax.into(), 1.into()]),
            [0x66, 0xB8, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn mov_memory_forms() {
        let esp12 = MemoryOperand::dword(Esp).disp(12);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![Ecx.into(), esp12.into()]),
            [0x8B, 0x4C, 0x24, 0x0C]
        );
        // [ebp] needs an explicit zero disp8
        let ebp = MemoryOperand::dword(Ebp);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![ebp.into(), 0.into()]),
            [0xC7, 0x45, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        let abs = MemoryOperand::absolute(OperandSize::Byte, 0xB8000);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![abs.into(), Al.into()]),
            [0x88, 0x05, 0x00, 0x80, 0x0B, 0x00]
        );
        let sib = MemoryOperand::dword(Ebx).index(Esi, 4).disp(-8);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![Eax.into(), sib.into()]),
            [0x8B, 0x44, 0xB3, 0xF8]
        );
    }

    #[test]
    fn segment_and_address_size_prefixes() {
        let fs = MemoryOperand::dword(Eax).segment(Fs);
        assert_eq!(enc32(Mnemonic::Mov, vec![Ebx.into(), fs.into()]), [0x64, 0x8B, 0x18]);

        // 16-bit addressing in 32-bit mode: 0x67
        let bx_si = MemoryOperand::word(Bx).index(Si, 1);
        assert_eq!(
            enc32(Mnemonic::Mov, vec![Ax.into(), bx_si.clone().into()]),
            [0x67, 0x66, 0x8B, 0x00]
        );
        assert_eq!(enc16(Mnemonic::Mov, vec![Ax.into(), bx_si.into()]), [0x8B, 0x00]);

        // [bp] has no mod=00 form in 16-bit addressing
        let bp = MemoryOperand::word(Bp);
        assert_eq!(enc16(Mnemonic::Mov, vec![Ax.into(), bp.into()]), [0x8B, 0x46, 0x00]);
    }

    #[test]
    fn symbolic_displacement_uses_full_width() {
        let mem = MemoryOperand::label(OperandSize::Dword, "counter");
        let mut cx = EncodeCtx::sizing(true, BranchForm::Near);
        assert_eq!(
            enc_with(cx, Mnemonic::Inc, vec![mem.clone().into()]),
            [0xFF, 0x05, 0x00, 0x00, 0x00, 0x00]
        );
        cx.mem_disp = Some(0x0010_2004);
        assert_eq!(
            enc_with(cx, Mnemonic::Inc, vec![mem.into()]),
            [0xFF, 0x05, 0x04, 0x20, 0x10, 0x00]
        );

        // a base register with a symbolic displacement still takes disp32
        let based = MemoryOperand::dword(Ebx).label_delta("table", 4);
        cx.mem_disp = Some(8);
        assert_eq!(
            enc_with(cx, Mnemonic::Mov, vec![Eax.into(), based.into()]),
            [0x8B, 0x83, 0x08, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn alu_forms() {
        assert_eq!(enc32(Mnemonic::Add, vec![Esp.into(), 8.into()]), [0x83, 0xC4, 0x08]);
        assert_eq!(enc32(Mnemonic::Cmp, vec![Ecx.into(), 64.into()]), [0x83, 0xF9, 0x40]);
        assert_eq!(enc32(Mnemonic::Or, vec![Ecx.into(), 0x20.into()]), [0x83, 0xC9, 0x20]);
        assert_eq!(
            enc32(Mnemonic::Add, vec![Eax.into(), 0x1000.into()]),
            [0x05, 0x00, 0x10, 0x00, 0x00]
        );
        assert_eq!(enc32(Mnemonic::Sub, vec![Al.into(), 1.into()]), [0x2C, 0x01]);
        assert_eq!(enc32(Mnemonic::Xor, vec![Eax.into(), Eax.into()]), [0x31, 0xC0]);
        assert_eq!(enc32(Mnemonic::Sub, vec![Ebx.into(), Ecx.into()]), [0x29, 0xCB]);
        assert_eq!(
            enc32(Mnemonic::Cmp, vec![Ebx.into(), 0x1234.into()]),
            [0x81, 0xFB, 0x34, 0x12, 0x00, 0x00]
        );
    }

    #[test]
    fn label_immediate_is_never_narrowed() {
        let mut cx = EncodeCtx::sizing(true, BranchForm::Near);
        cx.target = Some(4);
        assert_eq!(
            enc_with(cx, Mnemonic::Push, vec![Operand::label("msg")]),
            [0x68, 0x04, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            enc_with(cx, Mnemonic::Cmp, vec![Ebx.into(), Operand::label("msg")]),
            [0x81, 0xFB, 0x04, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_and_unary() {
        assert_eq!(enc32(Mnemonic::Test, vec![Ecx.into(), Ecx.into()]), [0x85, 0xC9]);
        assert_eq!(enc32(Mnemonic::Test, vec![Al.into(), 1.into()]), [0xA8, 0x01]);
        assert_eq!(enc32(Mnemonic::Not, vec![Eax.into()]), [0xF7, 0xD0]);
        assert_eq!(enc32(Mnemonic::Neg, vec![Edx.into()]), [0xF7, 0xDA]);
        assert_eq!(enc32(Mnemonic::Div, vec![Ecx.into()]), [0xF7, 0xF1]);
        assert_eq!(enc32(Mnemonic::Imul, vec![Eax.into(), Ebx.into()]), [0x0F, 0xAF, 0xC3]);
        assert_eq!(
            enc32(Mnemonic::Imul, vec![Eax.into(), Ebx.into(), 10.into()]),
            [0x6B, 0xC3, 0x0A]
        );
    }

    #[test]
    fn inc_dec_and_shifts() {
        assert_eq!(enc32(Mnemonic::Inc, vec![Eax.into()]), [0x40]);
        assert_eq!(enc32(Mnemonic::Dec, vec![Edi.into()]), [0x4F]);
        assert_eq!(enc32(Mnemonic::Inc, vec![Bl.into()]), [0xFE, 0xC3]);
        assert_eq!(enc32(Mnemonic::Shl, vec![Eax.into(), Cl.into()]), [0xD3, 0xE0]);
        assert_eq!(enc32(Mnemonic::Shr, vec![Eax.into(), Cl.into()]), [0xD3, 0xE8]);
        assert_eq!(enc32(Mnemonic::Sar, vec![Edx.into(), 31.into()]), [0xC1, 0xFA, 0x1F]);
        assert_eq!(enc32(Mnemonic::Shl, vec![Eax.into(), 1.into()]), [0xD1, 0xE0]);
    }

    #[test]
    fn stack_forms() {
        assert_eq!(enc32(Mnemonic::Push, vec![Ebx.into()]), [0x53]);
        assert_eq!(enc32(Mnemonic::Pop, vec![Esi.into()]), [0x5E]);
        assert_eq!(enc32(Mnemonic::Push, vec![1.into()]), [0x6A, 0x01]);
        assert_eq!(enc32(Mnemonic::Push, vec![Ds.into()]), [0x1E]);
        assert_eq!(enc32(Mnemonic::Pop, vec![Gs.into()]), [0x0F, 0xA9]);
        assert!(matches!(
            err32(Mnemonic::Pop, vec![Cs.into()]),
            AsmError::InvalidOperands { .. }
        ));
    }

    #[test]
    fn branch_forms() {
        let mut cx = EncodeCtx::sizing(true, BranchForm::Short);
        cx.target = Some(0);
        assert_eq!(enc_with(cx, Mnemonic::Jmp, vec!["start".into()]), [0xEB, 0xFE]);

        cx.form = BranchForm::Near;
        assert_eq!(
            enc_with(cx, Mnemonic::Jmp, vec!["start".into()]),
            [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]
        );

        cx.offset = 0x25;
        cx.target = Some(0x2C);
        assert_eq!(
            enc_with(cx, Mnemonic::Call, vec!["main".into()]),
            [0xE8, 0x02, 0x00, 0x00, 0x00]
        );
        // call has no short form
        cx.form = BranchForm::Short;
        assert_eq!(enc_with(cx, Mnemonic::Call, vec!["main".into()]).len(), 5);

        cx.offset = 0;
        cx.target = Some(0x10);
        assert_eq!(
            enc_with(cx, Mnemonic::Jcc(Condition::Ne), vec!["x".into()]),
            [0x75, 0x0E]
        );
        cx.form = BranchForm::Near;
        assert_eq!(
            enc_with(cx, Mnemonic::Jcc(Condition::Ne), vec!["x".into()]),
            [0x0F, 0x85, 0x0A, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn near_branches_are_rel16_in_real_mode() {
        let mut cx = EncodeCtx::sizing(false, BranchForm::Near);
        cx.target = Some(0x103);
        assert_eq!(enc_with(cx, Mnemonic::Jmp, vec!["x".into()]), [0xE9, 0x00, 0x01]);
        assert_eq!(
            enc_with(cx, Mnemonic::Jcc(Condition::E), vec!["x".into()]),
            [0x0F, 0x84, 0xFF, 0x00]
        );
    }

    #[test]
    fn short_branch_out_of_range() {
        let mut cx = EncodeCtx::sizing(true, BranchForm::Short);
        cx.target = Some(200);
        let err = encode_machine(&Machine::new(Mnemonic::Jmp, vec!["far".into()]), &cx).unwrap_err();
        assert_eq!(
            err,
            AsmError::BranchOutOfRange {
                label: "far".into(),
                disp: 198,
                max: 127
            }
        );
    }

    #[test]
    fn indirect_branches() {
        assert_eq!(enc32(Mnemonic::Call, vec![Eax.into()]), [0xFF, 0xD0]);
        assert_eq!(enc32(Mnemonic::Jmp, vec![Ebx.into()]), [0xFF, 0xE3]);
        let mem = MemoryOperand::dword(Eax);
        assert_eq!(enc32(Mnemonic::Call, vec![mem.into()]), [0xFF, 0x10]);
    }

    #[test]
    fn fixed_and_system() {
        assert_eq!(enc32(Mnemonic::Ret, vec![]), [0xC3]);
        assert_eq!(enc32(Mnemonic::Ret, vec![8.into()]), [0xC2, 0x08, 0x00]);
        assert_eq!(enc32(Mnemonic::Int, vec![0x80.into()]), [0xCD, 0x80]);
        assert_eq!(enc32(Mnemonic::Pushad, vec![]), [0x60]);
        assert_eq!(enc16(Mnemonic::Pushad, vec![]), [0x66, 0x60]);
        assert_eq!(enc16(Mnemonic::Cli, vec![]), [0xFA]);
        assert_eq!(enc32(Mnemonic::Out, vec![0x20.into(), Al.into()]), [0xE6, 0x20]);
        assert_eq!(enc32(Mnemonic::In, vec![Al.into(), Dx.into()]), [0xEC]);
        let gdt = MemoryOperand::label(OperandSize::Qword, "gdt_ptr");
        assert_eq!(
            enc32(Mnemonic::Lgdt, vec![gdt.into()]),
            [0x0F, 0x01, 0x15, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            enc32(Mnemonic::Setcc(Condition::E), vec![Al.into()]),
            [0x0F, 0x94, 0xC0]
        );
        assert_eq!(enc32(Mnemonic::Xchg, vec![Eax.into(), Ecx.into()]), [0x91]);
        assert_eq!(enc32(Mnemonic::Movzx, vec![Eax.into(), Bl.into()]), [0x0F, 0xB6, 0xC3]);
        assert_eq!(enc32(Mnemonic::Movsx, vec![Eax.into(), Bx.into()]), [0x0F, 0xBF, 0xC3]);
        assert_eq!(
            enc32(Mnemonic::Lea, vec![Eax.into(), MemoryOperand::dword(Ebx).disp(4).into()]),
            [0x8D, 0x43, 0x04]
        );
    }

    #[test]
    fn rejects_bad_operands() {
        assert!(matches!(
            err32(Mnemonic::Mov, vec![Eax.into(), Bx.into()]),
            AsmError::InvalidOperands { .. }
        ));
        assert!(matches!(
            err32(Mnemonic::Mov, vec![Al.into(), 0x1FF.into()]),
            AsmError::ImmediateOverflow { value: 0x1FF, bits: 8 }
        ));
        assert!(matches!(
            err32(Mnemonic::Inc, vec![MemoryOperand::qword(Eax).into()]),
            AsmError::Unsupported { .. }
        ));
        assert!(matches!(
            err32(Mnemonic::Nop, vec![Eax.into()]),
            AsmError::InvalidOperands { .. }
        ));
    }

    #[test]
    fn encoded_len_of_pseudo_instructions() {
        let times = Instruction::Times {
            length: 8192,
            fill: 0,
        };
        assert_eq!(encoded_len(&times, true, BranchForm::Near).unwrap(), 8192);
        assert_eq!(
            encoded_len(&Instruction::Org(0x10_0000), true, BranchForm::Near).unwrap(),
            0
        );
        let dd = Instruction::Data {
            label: None,
            value: DataValue::Address("x".into()),
        };
        assert_eq!(encoded_len(&dd, false, BranchForm::Near).unwrap(), 4);
    }
}
