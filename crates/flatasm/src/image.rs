//! Multiboot kernel image layout.
//!
//! A composed image has a fixed shape:
//!
//! ```text
//! offset 0      multiboot header (8 dwords)
//! offset 0x20   entry stub: mov esp, stack top; [call ctor]; call entry; halt loop
//!               methods, each behind a label of its own name
//!               LSHL / LSHR / LSAR helper routines
//!               static field slots
//!               interned strings and other deferred data
//!               padding to the next page              <- data end (bss marker)
//!               stack                                 <- stack top
//! ```
//!
//! Everything after the data-end label takes address space but is never
//! written to the file.

use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

use crate::ir::{DataValue, MemoryOperand, Register};
use crate::stream::InstructionStream;

/// Multiboot header magic.
pub const MULTIBOOT_MAGIC: u32 = 0x1BAD_B002;

/// Page-align modules, provide memory info, and use the address fields.
pub const MULTIBOOT_FLAGS: u32 = 0x0001_0003;

/// Size of the multiboot header in bytes.
pub const MULTIBOOT_HEADER_SIZE: u32 = 32;

/// Native integer size of the target, in bytes.
pub const INT_SIZE: u32 = 4;

/// Entry stub label; the header's entry address points here.
pub const ENTRY_LABEL: &str = "__image_entry";
/// Halt loop at the end of the entry stub.
pub const HALT_LABEL: &str = "__image_halt";
/// First byte after the written data; the bss marker.
pub const DATA_END_LABEL: &str = "__image_data_end";
/// Top of the boot stack.
pub const STACK_TOP_LABEL: &str = "__image_stack_top";

/// 64-bit shift left of EDX:EAX.
pub const HELPER_LSHL: &str = "LSHL";
/// 64-bit logical shift right of EDX:EAX.
pub const HELPER_LSHR: &str = "LSHR";
/// 64-bit arithmetic shift right of EDX:EAX.
pub const HELPER_LSAR: &str = "LSAR";

/// The multiboot checksum: `magic + flags + checksum` wraps to zero.
pub const fn multiboot_checksum(magic: u32, flags: u32) -> u32 {
    magic.wrapping_add(flags).wrapping_neg()
}

// ─── Configuration ─────────────────────────────────────────

/// Layout parameters of a composed image.
///
/// ```
/// use flatasm::ImageConfig;
///
/// let config = ImageConfig::default()
///     .entry("kmain")
///     .static_ctor("kinit")
///     .stack_size(16 * 1024);
/// assert_eq!(config.load_address_value(), 0x0010_0000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageConfig {
    load_address: u32,
    flags: u32,
    stack_size: u32,
    page_alignment: u32,
    entry: String,
    static_ctor: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            load_address: 0x0010_0000,
            flags: MULTIBOOT_FLAGS,
            stack_size: 8192,
            page_alignment: 4096,
            entry: String::from("kernel_main"),
            static_ctor: None,
        }
    }
}

impl ImageConfig {
    /// Where the bootloader places image offset zero.
    pub fn load_address(mut self, address: u32) -> Self {
        self.load_address = address;
        self
    }

    /// Multiboot header flags.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Size of the boot stack in bytes.
    pub fn stack_size(mut self, size: u32) -> Self {
        self.stack_size = size;
        self
    }

    /// Alignment of the end of the written data.
    pub fn page_alignment(mut self, alignment: u32) -> Self {
        self.page_alignment = alignment;
        self
    }

    /// Label of the kernel entry method.
    pub fn entry(mut self, label: impl Into<String>) -> Self {
        self.entry = label.into();
        self
    }

    /// Label of the static constructor, called before the entry method when
    /// the program contains a method of that name.
    pub fn static_ctor(mut self, label: impl Into<String>) -> Self {
        self.static_ctor = Some(label.into());
        self
    }

    /// Configured load address.
    pub fn load_address_value(&self) -> u32 {
        self.load_address
    }

    /// Configured multiboot flags.
    pub fn flags_value(&self) -> u32 {
        self.flags
    }

    /// Configured stack size.
    pub fn stack_size_value(&self) -> u32 {
        self.stack_size
    }

    /// Configured page alignment.
    pub fn page_alignment_value(&self) -> u32 {
        self.page_alignment
    }

    /// Configured entry label.
    pub fn entry_label(&self) -> &str {
        &self.entry
    }

    /// Configured static constructor label.
    pub fn static_ctor_label(&self) -> Option<&str> {
        self.static_ctor.as_deref()
    }
}

// ─── Program ───────────────────────────────────────────────

/// Storage class of a field, as the front-end reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldType {
    /// Signed 8-bit.
    I1,
    /// Unsigned 8-bit.
    U1,
    /// Signed 16-bit.
    I2,
    /// Unsigned 16-bit.
    U2,
    /// Signed 32-bit.
    I4,
    /// Unsigned 32-bit.
    U4,
    /// Native signed integer.
    I,
    /// Native unsigned integer.
    U,
    /// 32-bit float.
    R4,
    /// Signed 64-bit.
    I8,
    /// Unsigned 64-bit.
    U8,
    /// 64-bit float.
    R8,
}

impl FieldType {
    /// Storage size in bytes.
    pub fn size(self) -> u32 {
        match self {
            FieldType::I1 | FieldType::U1 => 1,
            FieldType::I2 | FieldType::U2 => 2,
            FieldType::I4 | FieldType::U4 | FieldType::I | FieldType::U | FieldType::R4 => {
                INT_SIZE
            }
            FieldType::I8 | FieldType::U8 | FieldType::R8 => 8,
        }
    }

    /// Whether values of this type live in memory rather than a spare
    /// register during translation.
    pub fn needs_spill(self) -> bool {
        matches!(self, FieldType::I8 | FieldType::R4 | FieldType::R8)
    }
}

/// A static field: a labeled, zero-initialized slot in the data area.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticField {
    /// Label of the slot, usually `Type::field`.
    pub name: String,
    /// Storage class.
    pub ty: FieldType,
}

impl StaticField {
    /// Create a static field.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Instance-field layout of one type, for `Type::field` offset queries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeLayout {
    /// Fully qualified type name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<(String, FieldType)>,
}

impl TypeLayout {
    /// A type with no fields.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    /// Byte offset of `field`: the summed sizes of the fields before it.
    pub fn offset_of(&self, field: &str) -> Option<u32> {
        let mut offset = 0;
        for (name, ty) in &self.fields {
            if name == field {
                return Some(offset);
            }
            offset += ty.size();
        }
        None
    }
}

/// The translated code of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MethodCode {
    /// Label placed before the code.
    pub name: String,
    /// The method body.
    pub code: InstructionStream,
}

impl MethodCode {
    /// Create a method from its name and body.
    pub fn new(name: impl Into<String>, code: InstructionStream) -> Self {
        Self {
            name: name.into(),
            code,
        }
    }
}

/// Everything the composer places into an image, in program order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Program {
    /// Methods in program order.
    pub methods: Vec<MethodCode>,
    /// Static fields in declaration order.
    pub statics: Vec<StaticField>,
}

impl Program {
    /// An empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a method.
    pub fn method(mut self, method: MethodCode) -> Self {
        self.methods.push(method);
        self
    }

    /// Append a static field.
    pub fn static_field(mut self, field: StaticField) -> Self {
        self.statics.push(field);
        self
    }

    /// Whether a method named `name` exists.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

// ─── Composer pieces ───────────────────────────────────────

/// Multiboot header. Load-end, bss-end, and entry are label addresses
/// back-patched during encoding.
pub(crate) fn emit_multiboot_header(code: &mut InstructionStream, config: &ImageConfig) {
    code.dd(MULTIBOOT_MAGIC)
        .dd(config.flags)
        .dd(multiboot_checksum(MULTIBOOT_MAGIC, config.flags))
        // header address
        .dd(config.load_address)
        // load address
        .dd(config.load_address)
        .dd_address(DATA_END_LABEL)
        .dd_address(STACK_TOP_LABEL)
        .dd_address(ENTRY_LABEL);
}

/// `ORG`, then the entry stub.
pub(crate) fn emit_entry_stub(code: &mut InstructionStream, config: &ImageConfig, call_ctor: bool) {
    code.org(config.load_address)
        .label(ENTRY_LABEL)
        .mov(Register::Esp, STACK_TOP_LABEL);
    if let Some(ctor) = config.static_ctor.as_deref().filter(|_| call_ctor) {
        code.call(ctor);
    }
    code.call(config.entry.as_str())
        .label(HALT_LABEL)
        .jmp(HALT_LABEL);
}

/// The 64-bit shift helpers. Arguments on the stack: `[esp+4]` high dword,
/// `[esp+8]` low dword, `[esp+12]` count. Result in EDX:EAX.
pub(crate) fn emit_helpers(code: &mut InstructionStream) {
    emit_lshl(code);
    emit_shift_right(code, HELPER_LSHR, false);
    emit_shift_right(code, HELPER_LSAR, true);
}

fn load_shift_arguments(code: &mut InstructionStream) {
    code.mov(Register::Ecx, MemoryOperand::dword(Register::Esp).disp(12))
        .mov(Register::Eax, MemoryOperand::dword(Register::Esp).disp(8))
        .mov(Register::Edx, MemoryOperand::dword(Register::Esp).disp(4));
}

fn emit_lshl(code: &mut InstructionStream) {
    use Register::*;
    let exit = [HELPER_LSHL, "_EXIT"].concat();
    let hi_shift = [HELPER_LSHL, "_HI_SHIFT"].concat();
    let start = [HELPER_LSHL, "_START"].concat();

    code.label(HELPER_LSHL);
    load_shift_arguments(code);
    code.cmp(Ecx, 64)
        .jb(&start)
        .or(Ecx, 0x20)
        .label(start.as_str())
        .and(Ecx, 63)
        .test(Ecx, Ecx)
        .jz(&exit)
        .cmp(Ecx, 32)
        .jae(&hi_shift)
        .push(Ebx)
        .push(Esi)
        .mov(Esi, Eax)
        .shl(Esi, Cl)
        .shl(Edx, Cl)
        .mov(Ebx, 32)
        .sub(Ebx, Ecx)
        .mov(Ecx, Ebx)
        .shr(Eax, Cl)
        .or(Edx, Eax)
        .mov(Eax, Esi)
        .pop(Esi)
        .pop(Ebx)
        .jmp(exit.as_str())
        .label(hi_shift.as_str())
        .mov(Edx, Eax)
        .xor(Eax, Eax)
        .sub(Ecx, 32)
        .shl(Edx, Cl)
        .label(exit.as_str())
        .ret();
}

/// LSHR and LSAR differ only in the shift used on the high dword and in how
/// the high dword is filled for counts of 32 and above.
fn emit_shift_right(code: &mut InstructionStream, name: &str, arithmetic: bool) {
    use Register::*;
    let exit = [name, "_EXIT"].concat();
    let hi_shift = [name, "_HI_SHIFT"].concat();
    let shift = |code: &mut InstructionStream, reg: Register| {
        if arithmetic {
            code.sar(reg, Cl);
        } else {
            code.shr(reg, Cl);
        }
    };

    code.label(name);
    load_shift_arguments(code);
    code.and(Ecx, 63)
        .test(Ecx, Ecx)
        .jz(&exit)
        .cmp(Ecx, 32)
        .jae(&hi_shift)
        .push(Ebx)
        .push(Esi)
        .mov(Esi, Edx);
    shift(code, Esi);
    code.shr(Eax, Cl)
        .mov(Ebx, 32)
        .sub(Ebx, Ecx)
        .mov(Ecx, Ebx)
        .shl(Edx, Cl)
        .or(Eax, Edx)
        .mov(Edx, Esi)
        .pop(Esi)
        .pop(Ebx)
        .jmp(exit.as_str())
        .label(hi_shift.as_str())
        .mov(Eax, Edx);
    if arithmetic {
        code.sub(Ecx, 32).sar(Eax, Cl).sar(Edx, 31);
    } else {
        code.xor(Edx, Edx).sub(Ecx, 32).shr(Eax, Cl);
    }
    code.label(exit.as_str()).ret();
}

/// One zero slot per static field. 8-byte slots are two dwords.
pub(crate) fn emit_statics(code: &mut InstructionStream, statics: &[StaticField]) {
    for field in statics {
        let value = match field.ty.size() {
            1 => DataValue::Bytes(vec![0]),
            2 => DataValue::Word(0),
            4 => DataValue::Dword(0),
            _ => DataValue::Bytes(vec![0; 8]),
        };
        code.named_data(field.name.as_str(), value);
    }
}

/// Page padding, the data-end marker, and the stack.
pub(crate) fn emit_tail(code: &mut InstructionStream, config: &ImageConfig) {
    code.align(config.page_alignment)
        .label(DATA_END_LABEL)
        .times(config.stack_size, 0)
        .label(STACK_TOP_LABEL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction;

    #[test]
    fn checksum_wraps_to_zero() {
        let checksum = multiboot_checksum(MULTIBOOT_MAGIC, MULTIBOOT_FLAGS);
        assert_eq!(checksum, 0xE451_4FFB);
        assert_eq!(
            MULTIBOOT_MAGIC
                .wrapping_add(MULTIBOOT_FLAGS)
                .wrapping_add(checksum),
            0
        );
    }

    #[test]
    fn field_sizes_and_spills() {
        assert_eq!(FieldType::U1.size(), 1);
        assert_eq!(FieldType::I2.size(), 2);
        assert_eq!(FieldType::U.size(), INT_SIZE);
        assert_eq!(FieldType::R8.size(), 8);
        assert!(FieldType::I8.needs_spill());
        assert!(FieldType::R4.needs_spill());
        assert!(!FieldType::I4.needs_spill());
    }

    #[test]
    fn type_layout_offsets() {
        let point = TypeLayout::new("Geometry.Point")
            .field("tag", FieldType::U1)
            .field("x", FieldType::I4)
            .field("y", FieldType::I8);
        assert_eq!(point.offset_of("tag"), Some(0));
        assert_eq!(point.offset_of("x"), Some(1));
        assert_eq!(point.offset_of("y"), Some(5));
        assert_eq!(point.offset_of("z"), None);
    }

    #[test]
    fn header_is_eight_dwords() {
        let mut code = InstructionStream::new();
        emit_multiboot_header(&mut code, &ImageConfig::default());
        assert_eq!(code.len(), 8);
        let size: u64 = code.iter().map(|i| i.size(true).unwrap()).sum();
        assert_eq!(size, u64::from(MULTIBOOT_HEADER_SIZE));
        assert_eq!(code[7].reference().map(|r| r.label), Some(ENTRY_LABEL));
    }

    #[test]
    fn ctor_call_is_optional() {
        let config = ImageConfig::default().static_ctor("init");
        let mut with = InstructionStream::new();
        emit_entry_stub(&mut with, &config, true);
        let mut without = InstructionStream::new();
        emit_entry_stub(&mut without, &config, false);
        assert_eq!(with.len(), without.len() + 1);
        assert!(with
            .iter()
            .any(|i| i.reference().is_some_and(|r| r.label == "init")));
    }

    #[test]
    fn helpers_encode() {
        let mut code = InstructionStream::new();
        emit_helpers(&mut code);
        let image = code.encode().unwrap();
        // mov ecx, [esp+12]
        assert_eq!(&image.bytes()[..4], &[0x8B, 0x4C, 0x24, 0x0C]);
        assert_eq!(image.label_address(HELPER_LSHL), Some(0));
        assert!(image.label_address(HELPER_LSHR).is_some());
        assert!(image.label_address(HELPER_LSAR).is_some());
        // every helper jump is within rel8 range
        assert_eq!(image.shrunk(), 10);
    }

    #[test]
    fn statics_are_zero_slots() {
        let mut code = InstructionStream::new();
        emit_statics(
            &mut code,
            &[
                StaticField::new("K::a", FieldType::U1),
                StaticField::new("K::b", FieldType::I2),
                StaticField::new("K::c", FieldType::I4),
                StaticField::new("K::d", FieldType::R8),
            ],
        );
        let image = code.encode().unwrap();
        assert_eq!(image.bytes(), &[0u8; 15]);
        assert_eq!(image.label_address("K::d"), Some(7));
        assert!(matches!(code[3], Instruction::Data { .. }));
    }
}
