//! Label resolution by linear replay of the instruction stream.
//!
//! The cursor rules are shared by [`resolve_label`] and by the linker's
//! per-iteration [`Layout`]:
//!
//! - `Bits32` switches the active mode.
//! - `Org` sets the origin: absolute address = origin + image offset.
//! - `Offset` moves the counter forward to an absolute image offset.
//! - `Align` rounds the counter up unless it is already aligned.
//! - `Times` adds its length; everything else adds its encoded size.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::encoder::encoded_len;
use crate::error::AsmError;
use crate::ir::{BranchForm, Instruction};

/// Mode a stream starts in before any `Bits32` marker.
pub const DEFAULT_BITS32: bool = true;

/// Where a label lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelAddress {
    /// Byte offset from the start of the image.
    pub offset: u64,
    /// Load address: origin in effect at the label plus `offset`.
    pub address: u64,
}

/// Replay state: image offset, origin base, and active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Current image offset.
    pub offset: u64,
    /// Origin base in effect.
    pub origin: u32,
    /// Active mode.
    pub bits32: bool,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            offset: 0,
            origin: 0,
            bits32: DEFAULT_BITS32,
        }
    }
}

impl Cursor {
    /// Absolute address of the current position.
    #[inline]
    pub fn address(&self) -> u64 {
        u64::from(self.origin) + self.offset
    }

    /// Apply one instruction and return the number of bytes it occupies.
    pub fn advance(&mut self, instr: &Instruction, form: BranchForm) -> Result<u64, AsmError> {
        let size = match instr {
            Instruction::Bits32(bits32) => {
                self.bits32 = *bits32;
                0
            }
            Instruction::Org(origin) => {
                self.origin = *origin;
                0
            }
            Instruction::Offset(target) => {
                let target = u64::from(*target);
                if target < self.offset {
                    return Err(AsmError::OffsetBehindCursor {
                        target,
                        current: self.offset,
                    });
                }
                target - self.offset
            }
            Instruction::Align(align) => {
                if *align == 0 {
                    return Err(AsmError::InvalidAlignment { value: 0 });
                }
                let align = u64::from(*align);
                (align - self.offset % align) % align
            }
            other => encoded_len(other, self.bits32, form)?,
        };
        self.offset += size;
        Ok(size)
    }
}

/// Find `name` by replaying `stream` from offset zero.
///
/// Matching is case-insensitive and the first definition wins.
pub fn resolve_label(stream: &[Instruction], name: &str) -> Result<LabelAddress, AsmError> {
    let mut cursor = Cursor::default();
    for instr in stream {
        if let Instruction::Bits32(bits32) = instr {
            cursor.bits32 = *bits32;
        }
        if instr.defines(name) {
            return Ok(LabelAddress {
                offset: cursor.offset,
                address: cursor.address(),
            });
        }
        cursor.advance(instr, BranchForm::Near)?;
    }
    Err(AsmError::undefined(name))
}

// ─── Label index ────────────────────────────────────────────

/// First-match, case-insensitive map from label names to stream positions.
#[derive(Debug, Clone, Default)]
pub struct LabelIndex {
    folded: BTreeMap<String, usize>,
}

impl LabelIndex {
    /// Index every label in `stream`.
    ///
    /// Names that differ only in case are accepted (the first wins); the same
    /// exact name twice is a [`AsmError::DuplicateLabel`].
    pub fn build(stream: &[Instruction]) -> Result<Self, AsmError> {
        let mut exact: BTreeMap<&str, usize> = BTreeMap::new();
        let mut folded = BTreeMap::new();
        for (i, instr) in stream.iter().enumerate() {
            let Some(name) = instr.label() else {
                continue;
            };
            if let Some(&first) = exact.get(name) {
                return Err(AsmError::DuplicateLabel {
                    label: String::from(name),
                    first,
                    second: i,
                });
            }
            exact.insert(name, i);
            folded.entry(name.to_ascii_lowercase()).or_insert(i);
        }
        Ok(Self { folded })
    }

    /// Stream position of `name`.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.folded.get(&name.to_ascii_lowercase()).copied()
    }

    /// Stream position of `name`, or [`AsmError::UndefinedLabel`].
    pub fn require(&self, name: &str) -> Result<usize, AsmError> {
        self.get(name).ok_or_else(|| AsmError::undefined(name))
    }

    /// Number of distinct (case-folded) labels.
    pub fn len(&self) -> usize {
        self.folded.len()
    }

    /// Whether the stream defines no labels.
    pub fn is_empty(&self) -> bool {
        self.folded.is_empty()
    }
}

// ─── Layout snapshot ────────────────────────────────────────

/// Offsets, origins, modes, and sizes of every instruction for one set of
/// branch forms.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// Image offset of each instruction's first byte.
    pub offsets: Vec<u64>,
    /// Origin in effect at each instruction.
    pub origins: Vec<u32>,
    /// Mode in effect at each instruction.
    pub modes: Vec<bool>,
    /// Bytes each instruction occupies (padding included).
    pub sizes: Vec<u64>,
    /// Image offset after the last instruction.
    pub end: u64,
}

impl Layout {
    /// Lay out `stream` with the given per-instruction branch forms.
    pub fn compute(stream: &[Instruction], forms: &[BranchForm]) -> Result<Self, AsmError> {
        let mut layout = Self {
            offsets: Vec::with_capacity(stream.len()),
            origins: Vec::with_capacity(stream.len()),
            modes: Vec::with_capacity(stream.len()),
            sizes: Vec::with_capacity(stream.len()),
            end: 0,
        };
        let mut cursor = Cursor::default();
        for (i, instr) in stream.iter().enumerate() {
            if let Instruction::Bits32(bits32) = instr {
                cursor.bits32 = *bits32;
            }
            layout.offsets.push(cursor.offset);
            layout.origins.push(cursor.origin);
            layout.modes.push(cursor.bits32);
            let form = forms.get(i).copied().unwrap_or_default();
            let size = cursor.advance(instr, form)?;
            layout.sizes.push(size);
        }
        layout.end = cursor.offset;
        Ok(layout)
    }

    /// Absolute address of instruction `index`.
    #[inline]
    pub fn address(&self, index: usize) -> u64 {
        u64::from(self.origins[index]) + self.offsets[index]
    }

    /// Offset and address of instruction `index`.
    pub fn label_address(&self, index: usize) -> LabelAddress {
        LabelAddress {
            offset: self.offsets[index],
            address: self.address(index),
        }
    }
}
