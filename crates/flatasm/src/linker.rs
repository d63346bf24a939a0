//! Two-pass fixpoint encoding of an instruction stream.
//!
//! Pass 1 lays out the stream, resolves every reference against that
//! layout, and switches relative jumps whose target is within rel8 range to
//! their short form. A shrink is only kept if every short jump still reaches
//! its target in the layout that results, since `Align` and `Offset` can pin
//! a target while the jump moves. It repeats until an iteration changes
//! nothing. Forms only ever shrink, so the loop runs at most once per
//! shrinkable jump plus one final confirming iteration.
//!
//! Pass 2 emits bytes from the last layout, padding `Offset`/`Align` with
//! zeros and `Times` with its fill byte, and writing nothing after the bss
//! marker.

use alloc::collections::BTreeMap;
#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write as _;

use log::{debug, trace};

use crate::encoder::{encode_machine, EncodeCtx};
use crate::error::AsmError;
use crate::ir::{BranchForm, DataValue, Instruction, RefKind};
use crate::resolver::{LabelAddress, LabelIndex, Layout};

// ─── Side table ────────────────────────────────────────────

/// Values resolved for one instruction during pass 1.
///
/// The stream itself is never mutated; these live alongside it, indexed by
/// instruction position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Resolved {
    /// Target image offset (relative references) or absolute address
    /// (absolute references).
    pub(crate) target: Option<i64>,
    /// Absolute address of a symbolic memory displacement.
    pub(crate) mem_disp: Option<i64>,
}

// ─── Public API ────────────────────────────────────────────

/// Drives both passes over one instruction stream.
#[derive(Debug, Clone, Default)]
pub struct Linker {
    bss_marker: Option<String>,
}

impl Linker {
    /// Create a linker that writes every byte of the stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop writing bytes once the stream reaches `label`. Everything after
    /// it still takes address space.
    pub fn bss_marker(mut self, label: impl Into<String>) -> Self {
        self.bss_marker = Some(label.into());
        self
    }

    /// Run pass 1 and pass 2 over `stream`.
    pub fn link(&self, stream: &[Instruction]) -> Result<EncodedImage, AsmError> {
        let index = LabelIndex::build(stream)?;
        let (layout, resolved, forms, passes) = relax(stream, &index)?;
        let shrunk = forms.iter().filter(|f| **f == BranchForm::Short).count();
        let image = self.emit(stream, &index, &layout, &resolved, &forms, passes, shrunk)?;
        debug!(
            "encoded {} instructions into {} bytes ({} passes, {} short jumps)",
            stream.len(),
            image.bytes.len(),
            passes,
            shrunk
        );
        Ok(image)
    }

    // ── final emit ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        stream: &[Instruction],
        index: &LabelIndex,
        layout: &Layout,
        resolved: &[Resolved],
        forms: &[BranchForm],
        passes: usize,
        shrunk: usize,
    ) -> Result<EncodedImage, AsmError> {
        let bss_start = match &self.bss_marker {
            Some(marker) => Some(index.require(marker)?),
            None => None,
        };
        let written_end = bss_start.map_or(layout.end, |i| layout.offsets[i]);
        let mut output = Vec::with_capacity(written_end as usize);
        let mut listing = Vec::new();
        let mut labels = BTreeMap::new();
        let origin = stream
            .iter()
            .find_map(|i| match i {
                Instruction::Org(origin) => Some(*origin),
                _ => None,
            })
            .unwrap_or(0);

        for (i, instr) in stream.iter().enumerate() {
            if let Some(name) = instr.label() {
                labels
                    .entry(name.to_ascii_lowercase())
                    .or_insert_with(|| (String::from(name), layout.label_address(i)));
            }
            let writing = bss_start.map_or(true, |b| i < b);
            if writing {
                debug_assert_eq!(output.len() as u64, layout.offsets[i]);
                let start = output.len();
                emit_one(&mut output, instr, i, layout, resolved, forms)?;
                debug_assert_eq!((output.len() - start) as u64, layout.sizes[i]);
            }
            listing.push(ListingLine {
                offset: layout.offsets[i],
                address: layout.address(i),
                len: if writing { layout.sizes[i] } else { 0 },
                text: format!("{}", instr),
            });
        }

        Ok(EncodedImage {
            bytes: output,
            labels,
            origin,
            passes,
            shrunk,
            listing,
        })
    }
}

// ── branch relaxation ──────────────────────────────────

type Relaxed = (Layout, Vec<Resolved>, Vec<BranchForm>, usize);

/// Pass 1. Returns the final layout, the resolved side table, the branch
/// forms, and the number of iterations run.
fn relax(stream: &[Instruction], index: &LabelIndex) -> Result<Relaxed, AsmError> {
    let mut forms = vec![BranchForm::Near; stream.len()];
    let mut resolved = vec![Resolved::default(); stream.len()];
    let mut candidates = Vec::new();
    let shrinkable = stream
        .iter()
        .filter(|i| matches!(i, Instruction::Machine(m) if m.is_shrinkable()))
        .count();
    let max = shrinkable + 1;

    for pass in 1..=max {
        let layout = Layout::compute(stream, &forms)?;
        candidates.clear();

        for (i, instr) in stream.iter().enumerate() {
            if let Some(reference) = instr.reference() {
                let t = index.require(reference.label)?;
                match reference.kind {
                    RefKind::Absolute => {
                        resolved[i].target = Some(layout.address(t) as i64);
                    }
                    RefKind::Relative => {
                        let target = layout.offsets[t] as i64;
                        resolved[i].target = Some(target);
                        if forms[i] == BranchForm::Near
                            && matches!(instr, Instruction::Machine(m) if m.is_shrinkable())
                        {
                            // A forward target moves closer by the bytes this
                            // jump saves itself, unless padding in between
                            // absorbs them. `accept_shrinks` has the final say.
                            let saving = if t > i { layout.sizes[i] - 2 } else { 0 };
                            let disp = target - saving as i64 - (layout.offsets[i] + 2) as i64;
                            if (-128..=127).contains(&disp) {
                                candidates.push(i);
                            }
                        }
                    }
                }
            }
            if let Some((label, delta)) = instr.memory().and_then(|m| m.label_ref()) {
                let t = index.require(label)?;
                resolved[i].mem_disp = Some(layout.address(t) as i64 + i64::from(delta));
            }
        }

        let changed = accept_shrinks(stream, index, &mut forms, &candidates)?;
        trace!(
            "pass {}: {} bytes, {} of {} candidate jumps shortened",
            pass,
            layout.end,
            changed,
            candidates.len()
        );
        if changed == 0 {
            return Ok((layout, resolved, forms, pass));
        }
    }

    Err(AsmError::RelaxationLimit { max })
}

/// Switch `candidates` to their short form, keeping only the shrinks after
/// which every short jump in the stream still reaches its target. Returns
/// the number of jumps switched.
///
/// `Align` and `Offset` pin what follows them, so shrinking one jump can
/// push another jump's target out of rel8 range. The whole batch is tried
/// first, then each candidate on its own in stream order.
fn accept_shrinks(
    stream: &[Instruction],
    index: &LabelIndex,
    forms: &mut [BranchForm],
    candidates: &[usize],
) -> Result<usize, AsmError> {
    if candidates.is_empty() {
        return Ok(0);
    }
    for &i in candidates {
        forms[i] = BranchForm::Short;
    }
    if shorts_reach(stream, index, forms)? {
        for &i in candidates {
            trace!("short form for '{}'", stream[i]);
        }
        return Ok(candidates.len());
    }

    for &i in candidates {
        forms[i] = BranchForm::Near;
    }
    let mut accepted = 0;
    for &i in candidates {
        forms[i] = BranchForm::Short;
        if shorts_reach(stream, index, forms)? {
            trace!("short form for '{}'", stream[i]);
            accepted += 1;
        } else {
            trace!("keeping near form for '{}': padding moves its target", stream[i]);
            forms[i] = BranchForm::Near;
        }
    }
    Ok(accepted)
}

/// Whether every short jump fits rel8 in the layout `forms` produces.
fn shorts_reach(
    stream: &[Instruction],
    index: &LabelIndex,
    forms: &[BranchForm],
) -> Result<bool, AsmError> {
    let layout = Layout::compute(stream, forms)?;
    for (i, instr) in stream.iter().enumerate() {
        if forms[i] != BranchForm::Short {
            continue;
        }
        if let Some(reference) = instr.reference() {
            let t = index.require(reference.label)?;
            let end = layout.offsets[i] + layout.sizes[i];
            let disp = layout.offsets[t] as i64 - end as i64;
            if !(-128..=127).contains(&disp) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Append the bytes of instruction `i` to `output`.
fn emit_one(
    output: &mut Vec<u8>,
    instr: &Instruction,
    i: usize,
    layout: &Layout,
    resolved: &[Resolved],
    forms: &[BranchForm],
) -> Result<(), AsmError> {
    match instr {
        Instruction::Bits32(_) | Instruction::Org(_) | Instruction::Label(_) => {}
        Instruction::Offset(_) | Instruction::Align(_) => {
            output.resize(output.len() + layout.sizes[i] as usize, 0);
        }
        Instruction::Times { length, fill } => {
            output.resize(output.len() + *length as usize, *fill);
        }
        Instruction::Data { value, .. } => match value {
            DataValue::Bytes(bytes) => output.extend_from_slice(bytes),
            DataValue::Word(w) => output.extend_from_slice(&w.to_le_bytes()),
            DataValue::Dword(d) => output.extend_from_slice(&d.to_le_bytes()),
            DataValue::Address(label) => {
                let address = resolved[i]
                    .target
                    .ok_or_else(|| AsmError::undefined(label))?;
                let address = u32::try_from(address).map_err(|_| AsmError::ImmediateOverflow {
                    value: address,
                    bits: 32,
                })?;
                output.extend_from_slice(&address.to_le_bytes());
            }
        },
        Instruction::Machine(m) => {
            let cx = EncodeCtx {
                bits32: layout.modes[i],
                form: forms[i],
                offset: layout.offsets[i],
                target: resolved[i].target,
                mem_disp: resolved[i].mem_disp,
            };
            output.extend_from_slice(&encode_machine(m, &cx)?);
        }
    }
    Ok(())
}

// ─── Output ────────────────────────────────────────────────

/// One line of an [`EncodedImage::listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingLine {
    offset: u64,
    address: u64,
    len: u64,
    text: String,
}

/// A fully encoded flat image.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    bytes: Vec<u8>,
    labels: BTreeMap<String, (String, LabelAddress)>,
    origin: u32,
    passes: usize,
    shrunk: usize,
    listing: Vec<ListingLine>,
}

impl EncodedImage {
    /// The written bytes (the bss region is not included).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the image and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of written bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Origin set by the first `Org` of the stream, or zero.
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Number of pass-1 iterations.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Number of jumps encoded in their short form.
    pub fn shrunk(&self) -> usize {
        self.shrunk
    }

    /// Absolute address of a label (case-insensitive, first definition).
    pub fn label_address(&self, name: &str) -> Option<u64> {
        self.label(name).map(|l| l.address)
    }

    /// Offset and address of a label (case-insensitive, first definition).
    pub fn label(&self, name: &str) -> Option<LabelAddress> {
        self.labels
            .get(&name.to_ascii_lowercase())
            .map(|(_, at)| *at)
    }

    /// Every label with its absolute address, ordered by case-folded name.
    pub fn labels(&self) -> impl Iterator<Item = (&str, u64)> {
        self.labels
            .values()
            .map(|(name, at)| (name.as_str(), at.address))
    }

    /// Human-readable listing: offset, address, bytes, instruction.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for line in &self.listing {
            let start = line.offset as usize;
            let end = (start + line.len as usize).min(self.bytes.len());
            let bytes = self.bytes.get(start..end).unwrap_or(&[]);
            let mut hex = String::new();
            for b in bytes.iter().take(8) {
                let _ = write!(hex, "{:02X} ", b);
            }
            if bytes.len() > 8 {
                hex.push_str("...");
            }
            let _ = writeln!(
                out,
                "{:08X}  {:08X}  {:<27} {}",
                line.offset,
                line.address,
                hex.trim_end(),
                line.text
            );
        }
        out
    }

    /// Write the image bytes to `writer`.
    #[cfg(feature = "std")]
    pub fn write_to<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.bytes)?;
        writer.flush()
    }

    /// Write the image bytes to a file, replacing it if it exists.
    #[cfg(feature = "std")]
    pub fn write_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Condition, MemoryOperand, Mnemonic, Operand, OperandSize, Register};
    use alloc::vec;

    fn label(name: &str) -> Instruction {
        Instruction::Label(name.into())
    }

    fn jmp(target: &str) -> Instruction {
        Instruction::machine(Mnemonic::Jmp, vec![Operand::label(target)])
    }

    fn times(length: u32) -> Instruction {
        Instruction::Times { length, fill: 0x90 }
    }

    #[test]
    fn self_jump_shrinks_to_eb_fe() {
        let stream = vec![Instruction::Org(0x10_0000), label("start"), jmp("start")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(image.bytes(), &[0xEB, 0xFE]);
        assert_eq!(image.label_address("start"), Some(0x10_0000));
        assert_eq!(image.passes(), 2);
        assert_eq!(image.shrunk(), 1);
        assert_eq!(image.origin(), 0x10_0000);
    }

    #[test]
    fn far_jump_stays_near() {
        let stream = vec![jmp("end"), times(200), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..5], &[0xE9, 0xC8, 0x00, 0x00, 0x00]);
        assert_eq!(image.len(), 205);
        assert_eq!(image.shrunk(), 0);
        assert_eq!(image.passes(), 1);
    }

    #[test]
    fn close_jump_shrinks() {
        let stream = vec![jmp("end"), times(100), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..2], &[0xEB, 0x64]);
        assert_eq!(image.len(), 102);
    }

    #[test]
    fn boundary_127_and_128() {
        let stream = vec![jmp("end"), times(127), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..2], &[0xEB, 0x7F]);

        let stream = vec![jmp("end"), times(128), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..5], &[0xE9, 0x80, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn cascading_shrink_takes_extra_pass() {
        // The first jump only fits once the second one has shrunk.
        let stream = vec![
            jmp("end"),
            jmp("next"),
            label("next"),
            times(125),
            label("end"),
        ];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(image.shrunk(), 2);
        assert_eq!(image.passes(), 3);
        assert_eq!(image.len(), 2 + 2 + 125);
        assert_eq!(&image.bytes()[..4], &[0xEB, 0x7F, 0xEB, 0x00]);
    }

    #[test]
    fn conditional_jumps_shrink() {
        let stream = vec![
            label("top"),
            Instruction::machine(Mnemonic::Jcc(Condition::Ne), vec![Operand::label("top")]),
        ];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(image.bytes(), &[0x75, 0xFE]);
    }

    #[test]
    fn absolute_references_add_origin() {
        let stream = vec![
            Instruction::Org(0x10_0000),
            Instruction::machine(
                Mnemonic::Mov,
                vec![Register::Esp.into(), Operand::label("top")],
            ),
            Instruction::Data {
                label: None,
                value: DataValue::Address("top".into()),
            },
            label("top"),
        ];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(
            image.bytes(),
            &[0xBC, 0x09, 0x00, 0x10, 0x00, 0x09, 0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn memory_displacement_is_origin_label_delta() {
        let stream = vec![
            Instruction::Org(0x1000),
            Instruction::machine(
                Mnemonic::Mov,
                vec![
                    Register::Eax.into(),
                    MemoryOperand::new(OperandSize::Dword)
                        .label_delta("table", 4)
                        .into(),
                ],
            ),
            Instruction::Data {
                label: Some("table".into()),
                value: DataValue::Dword(0),
            },
        ];
        let image = Linker::new().link(&stream).unwrap();
        // table lives at offset 6, so the operand is 0x1000 + 6 + 4.
        assert_eq!(&image.bytes()[..6], &[0x8B, 0x05, 0x0A, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn bss_region_is_not_written() {
        let stream = vec![
            Instruction::Data {
                label: None,
                value: DataValue::Bytes(vec![1, 2, 3]),
            },
            label("bss"),
            Instruction::Times {
                length: 8192,
                fill: 0,
            },
            label("stack_top"),
        ];
        let image = Linker::new().bss_marker("bss").link(&stream).unwrap();
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert_eq!(image.label_address("stack_top"), Some(3 + 8192));
    }

    #[test]
    fn padding_fills() {
        let stream = vec![
            Instruction::machine(Mnemonic::Nop, vec![]),
            Instruction::Align(4),
            Instruction::Times { length: 2, fill: 0xCC },
            Instruction::Offset(8),
            Instruction::machine(Mnemonic::Hlt, vec![]),
        ];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(
            image.bytes(),
            &[0x90, 0, 0, 0, 0xCC, 0xCC, 0, 0, 0xF4]
        );
    }

    #[test]
    fn align_before_target_keeps_jump_near() {
        // Shrinking would leave the target at 132 and the jump ending at 2.
        let stream = vec![jmp("end"), times(127), Instruction::Align(4), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..5], &[0xE9, 0x7F, 0x00, 0x00, 0x00]);
        assert_eq!(image.len(), 132);
        assert_eq!(image.shrunk(), 0);
        assert_eq!(image.passes(), 1);
    }

    #[test]
    fn offset_before_target_keeps_jump_near() {
        let stream = vec![jmp("end"), times(100), Instruction::Offset(130), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..5], &[0xE9, 0x7D, 0x00, 0x00, 0x00]);
        assert_eq!(image.len(), 130);
        assert_eq!(image.shrunk(), 0);
    }

    #[test]
    fn align_before_close_target_still_shrinks() {
        let stream = vec![jmp("end"), times(10), Instruction::Align(4), label("end")];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..2], &[0xEB, 0x0A]);
        assert_eq!(image.len(), 12);
        assert_eq!(image.shrunk(), 1);
    }

    #[test]
    fn shrink_that_strands_a_pinned_jump_is_refused() {
        // Each jump fits rel8 on its own, but shrinking the first moves `top`
        // back while the offset marker holds the second jump in place.
        let stream = vec![
            jmp("skip"),
            label("skip"),
            label("top"),
            times(10),
            Instruction::Offset(130),
            jmp("top"),
        ];
        let image = Linker::new().link(&stream).unwrap();
        assert_eq!(&image.bytes()[..2], &[0xEB, 0x00]);
        assert_eq!(&image.bytes()[130..], &[0xE9, 0x7B, 0xFF, 0xFF, 0xFF]);
        assert_eq!(image.len(), 135);
        assert_eq!(image.shrunk(), 1);
        assert_eq!(image.passes(), 2);
    }

    #[test]
    fn undefined_label_is_reported() {
        let stream = vec![jmp("nowhere")];
        assert_eq!(
            Linker::new().link(&stream).unwrap_err(),
            AsmError::UndefinedLabel {
                label: "nowhere".into()
            }
        );
    }

    #[test]
    fn duplicate_label_is_reported() {
        let stream = vec![label("a"), label("a")];
        assert!(matches!(
            Linker::new().link(&stream),
            Err(AsmError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn undefined_bss_marker_is_reported() {
        let stream = vec![label("a")];
        assert!(matches!(
            Linker::new().bss_marker("missing").link(&stream),
            Err(AsmError::UndefinedLabel { .. })
        ));
    }

    #[test]
    fn listing_shows_bytes_and_text() {
        let stream = vec![Instruction::Org(0x10_0000), label("start"), jmp("start")];
        let image = Linker::new().link(&stream).unwrap();
        let listing = image.listing();
        assert!(listing.contains("EB FE"));
        assert!(listing.contains("jmp start"));
        assert!(listing.contains("00100000"));
    }

    #[test]
    fn labels_iterate_with_addresses() {
        let stream = vec![Instruction::Org(0x200), label("b"), label("A")];
        let image = Linker::new().link(&stream).unwrap();
        let labels: Vec<_> = image.labels().collect();
        assert_eq!(labels, vec![("A", 0x200), ("b", 0x200)]);
    }
}
