//! # flatasm: Flat x86 Kernel Image Assembler
//!
//! `flatasm` turns per-method lists of typed x86 instructions into a flat,
//! bootable multiboot kernel image. There is no text parsing: code is built
//! with [`InstructionStream`] builders and encoded directly.
//!
//! ## Quick Start
//!
//! ```rust
//! use flatasm::{assemble, InstructionStream, Register};
//!
//! let mut code = InstructionStream::new();
//! code.mov(Register::Eax, 1).ret();
//! assert_eq!(assemble(code.instructions())?, vec![0xB8, 1, 0, 0, 0, 0xC3]);
//! # Ok::<(), flatasm::AsmError>(())
//! ```
//!
//! ## Features
//!
//! - **16- and 32-bit x86**: ModR/M, SIB, 16-bit addressing, segment overrides.
//! - **Jump shrinking**: near jumps become short jumps when the target is close.
//! - **Multiboot images**: header, entry stub, helpers, statics, strings, stack.
//! - **`no_std` + `alloc`**: usable from inside a kernel build tool or a kernel.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An encoder performs many narrowing / sign-changing casts between integer
// widths (i64→i8, u64→u32, etc.) and uses dense hex literals without
// separators (0x0FB6, 0xE9).  The lints below are expected and acceptable in
// this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::redundant_closure_for_method_calls,
    clippy::bool_to_int_with_if,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::needless_raw_string_hashes,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::fn_params_excessive_bools,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::manual_let_else,
    clippy::unnecessary_wraps,
    clippy::unused_self,
    clippy::map_unwrap_or,
    clippy::many_single_char_names,
    clippy::redundant_else,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::needless_continue
)]

extern crate alloc;

/// Assembler session: code stream, deferred data, counters, register pool.
pub mod assembler;
/// x86 instruction encoder (prefixes, ModR/M, SIB, immediates, branches).
pub mod encoder;
/// Error type.
pub mod error;
/// Image layout: multiboot header, entry stub, helpers, static fields.
pub mod image;
/// Intermediate representation: registers, operands, instructions.
pub mod ir;
/// Two-pass linker: jump shrinking and byte emission.
pub mod linker;
/// Spare-register pool for method translation.
pub mod regalloc;
/// Label resolution and layout replay.
pub mod resolver;
/// Instruction stream and its builders.
pub mod stream;

// Re-exports
pub use assembler::Assembler;
pub use encoder::InstrBytes;
pub use error::AsmError;
pub use image::{
    multiboot_checksum, FieldType, ImageConfig, MethodCode, Program, StaticField, TypeLayout,
    MULTIBOOT_FLAGS, MULTIBOOT_MAGIC,
};
pub use ir::{
    BranchForm, Condition, DataValue, Displacement, Instruction, Machine, MemoryOperand, Mnemonic,
    Operand, OperandSize, RefKind, Reference, Register,
};
pub use linker::{EncodedImage, Linker};
pub use regalloc::{narrow, RegisterPool, SpareRegister, SPARE_REGISTERS};
pub use resolver::{resolve_label, LabelAddress};
pub use stream::InstructionStream;

use alloc::vec::Vec;

/// Encode an instruction list into bytes with no bss cut-off.
///
/// # Errors
///
/// Returns [`AsmError`] on undefined or duplicate labels, invalid operand
/// combinations, out-of-range values, or malformed layout.
///
/// # Examples
///
/// ```rust
/// use flatasm::{assemble, InstructionStream};
///
/// let mut code = InstructionStream::new();
/// code.label("spin").jmp("spin");
/// assert_eq!(assemble(code.instructions())?, vec![0xEB, 0xFE]);
/// # Ok::<(), flatasm::AsmError>(())
/// ```
pub fn assemble(instructions: &[Instruction]) -> Result<Vec<u8>, AsmError> {
    Ok(Linker::new().link(instructions)?.into_bytes())
}
