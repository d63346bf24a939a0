//! Error types for stream layout, encoding, and image composition.
//!
//! Every variant is fatal for the current image build: there is no partial
//! output, and nothing is retried.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::ir::Register;

/// Assembly error with enough context to locate the offending method,
/// label, or construct.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsmError {
    /// Referenced label was never defined anywhere in the stream.
    UndefinedLabel {
        /// The undefined label name.
        label: String,
    },

    /// The exact same label name was registered twice.
    DuplicateLabel {
        /// The duplicated label name.
        label: String,
        /// Stream index of the first registration.
        first: usize,
        /// Stream index of the second registration.
        second: usize,
    },

    /// An offset marker would move the output cursor backward.
    OffsetBehindCursor {
        /// Requested absolute image offset.
        target: u64,
        /// Current image offset.
        current: u64,
    },

    /// Alignment directive with an operand of zero.
    InvalidAlignment {
        /// The rejected alignment operand.
        value: u32,
    },

    /// Short-form branch whose target drifted out of rel8 range.
    BranchOutOfRange {
        /// The target label name.
        label: String,
        /// The displacement that did not fit.
        disp: i64,
        /// Maximum allowed displacement magnitude.
        max: i64,
    },

    /// Immediate value does not fit the operand width.
    ImmediateOverflow {
        /// The immediate value that overflowed.
        value: i64,
        /// Operand width in bits.
        bits: u8,
    },

    /// Operand combination that the instruction cannot take.
    InvalidOperands {
        /// Mnemonic of the instruction.
        mnemonic: String,
        /// Description of why the operands are invalid.
        detail: String,
    },

    /// A construct for which the encoder has no table entry.
    Unsupported {
        /// Name of the unsupported construct.
        construct: String,
    },

    /// All spare registers are checked out.
    RegisterExhausted {
        /// Number of registers in the spare pool.
        pool_size: usize,
        /// Method being translated when the pool ran dry, if known.
        method: Option<String>,
    },

    /// A spare register was released while already free.
    RegisterAlreadyFree {
        /// The register released twice.
        register: Register,
    },

    /// A register outside the spare pool was handed back to it.
    NotASpareRegister {
        /// The foreign register.
        register: Register,
    },

    /// No 8-bit or 16-bit alias exists for a register.
    NoNarrowAlias {
        /// The 32-bit register.
        register: Register,
        /// Requested alias width in bits.
        bits: u16,
    },

    /// A method finished translation while still holding spare registers.
    RegistersNotReleased {
        /// The method that leaked registers.
        method: String,
        /// Number of registers still held.
        held: usize,
    },

    /// Field query without the `Type::field` separator.
    NotAFieldReference {
        /// The malformed query.
        value: String,
    },

    /// Field query naming an unknown type or field.
    UnknownField {
        /// The `Type::field` query.
        field: String,
    },

    /// Pass 1 did not reach a fixpoint within its iteration bound.
    RelaxationLimit {
        /// Maximum number of iterations allowed.
        max: usize,
    },
}

impl AsmError {
    pub(crate) fn unsupported(construct: impl Into<String>) -> Self {
        AsmError::Unsupported {
            construct: construct.into(),
        }
    }

    pub(crate) fn undefined(label: &str) -> Self {
        AsmError::UndefinedLabel {
            label: String::from(label),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::UndefinedLabel { label } => {
                write!(f, "label '{}' has not been found", label)
            }
            AsmError::DuplicateLabel {
                label,
                first,
                second,
            } => {
                write!(
                    f,
                    "duplicate label '{}' at instruction {} (first defined at instruction {})",
                    label, second, first
                )
            }
            AsmError::OffsetBehindCursor { target, current } => {
                write!(
                    f,
                    "wrong offset 0x{:X}: output cursor is already at 0x{:X}",
                    target, current
                )
            }
            AsmError::InvalidAlignment { value } => {
                write!(f, "invalid alignment {}", value)
            }
            AsmError::BranchOutOfRange { label, disp, max } => {
                write!(
                    f,
                    "branch target '{}' out of range (displacement={}, max=±{})",
                    label, disp, max
                )
            }
            AsmError::ImmediateOverflow { value, bits } => {
                write!(f, "immediate value {} does not fit in {} bits", value, bits)
            }
            AsmError::InvalidOperands { mnemonic, detail } => {
                write!(f, "invalid operand combination for '{}': {}", mnemonic, detail)
            }
            AsmError::Unsupported { construct } => {
                write!(f, "'{}' is not supported", construct)
            }
            AsmError::RegisterExhausted { pool_size, method } => match method {
                Some(method) => write!(
                    f,
                    "no spare registers left ({} in pool) while translating '{}'",
                    pool_size, method
                ),
                None => write!(f, "no spare registers left ({} in pool)", pool_size),
            },
            AsmError::RegisterAlreadyFree { register } => {
                write!(f, "{} is already free", register)
            }
            AsmError::NotASpareRegister { register } => {
                write!(f, "{} is not a spare register", register)
            }
            AsmError::NoNarrowAlias { register, bits } => {
                write!(f, "'{}' has no {}-bit register", register, bits)
            }
            AsmError::RegistersNotReleased { method, held } => {
                write!(
                    f,
                    "'{}' finished with {} spare register(s) still in use",
                    method, held
                )
            }
            AsmError::NotAFieldReference { value } => {
                write!(f, "'{}' is no field definition", value)
            }
            AsmError::UnknownField { field } => {
                write!(f, "'{}' has not been found", field)
            }
            AsmError::RelaxationLimit { max } => {
                write!(
                    f,
                    "jump shrinking did not converge within {} passes",
                    max
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AsmError {}
