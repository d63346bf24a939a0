//! The assembler session: one per image build.
//!
//! The session owns the global code stream and everything the translation of
//! methods accumulates on the side: the deferred data sub-stream, interned
//! strings, label counters, type layouts, and the spare-register pool.
//!
//! ```
//! use flatasm::{Assembler, ImageConfig, InstructionStream, MethodCode, Program, Register};
//!
//! let mut asm = Assembler::new();
//! asm.begin_method("kernel_main");
//! let greeting = asm.intern_string("hello");
//! let mut body = InstructionStream::new();
//! body.mov(Register::Esi, greeting.as_str()).ret();
//! asm.end_method()?;
//!
//! let program = Program::new().method(MethodCode::new("kernel_main", body));
//! let image = asm.build_image(&program, &ImageConfig::default())?;
//! assert_eq!(&image.bytes()[..4], &[0x02, 0xB0, 0xAD, 0x1B]);
//! # Ok::<(), flatasm::AsmError>(())
//! ```

use alloc::collections::BTreeMap;
#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
use core::ops::{Deref, DerefMut};

use log::debug;

use crate::error::AsmError;
use crate::image::{self, ImageConfig, Program, TypeLayout, DATA_END_LABEL};
use crate::linker::{EncodedImage, Linker};
use crate::regalloc::RegisterPool;
use crate::resolver::{resolve_label, LabelAddress};
use crate::stream::InstructionStream;

/// Prefix of interned-string labels.
pub const RESOURCE_PREFIX: &str = "Resource_";
/// Prefix of compare-result labels.
pub const COMPARE_PREFIX: &str = "CMP_";

/// An image build in progress.
///
/// Dereferences to its code stream, so instructions can be appended to the
/// session directly.
#[derive(Debug, Default)]
pub struct Assembler {
    code: InstructionStream,
    data: InstructionStream,
    resources: usize,
    compares: usize,
    strings: BTreeMap<String, String>,
    types: BTreeMap<String, TypeLayout>,
    registers: RegisterPool,
    method: Option<String>,
}

impl Assembler {
    /// An empty session.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Method context ────────────────────────────────────

    /// Start translating `name`.
    ///
    /// The pool is not cleared: a register an earlier method never gave back
    /// stays checked out and surfaces as exhaustion here.
    pub fn begin_method(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        debug!("translating '{}'", name);
        self.registers.set_method(Some(name.clone()));
        self.method = Some(name);
        self
    }

    /// Finish the current method.
    ///
    /// Fails with [`AsmError::RegistersNotReleased`] if a spare register is
    /// still checked out. The pool is left as is.
    pub fn end_method(&mut self) -> Result<(), AsmError> {
        if !self.registers.all_free() {
            return Err(AsmError::RegistersNotReleased {
                method: self.method.clone().unwrap_or_default(),
                held: self.registers.in_use(),
            });
        }
        self.method = None;
        self.registers.set_method(None);
        Ok(())
    }

    /// The method being translated.
    pub fn current_method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The spare-register pool.
    pub fn registers(&self) -> &RegisterPool {
        &self.registers
    }

    /// The spare-register pool, for checkouts and releases.
    pub fn registers_mut(&mut self) -> &mut RegisterPool {
        &mut self.registers
    }

    // ─── Labels and deferred data ──────────────────────────

    /// Label of a NUL-terminated copy of `text` in the data area.
    ///
    /// The same content always yields the same label and is stored once.
    pub fn intern_string(&mut self, text: &str) -> String {
        if let Some(label) = self.strings.get(text) {
            return label.clone();
        }
        let label = self.resource_label();
        self.data.data_string(label.as_str(), text);
        self.strings.insert(String::from(text), label.clone());
        label
    }

    /// A fresh `Resource_N` label.
    pub fn resource_label(&mut self) -> String {
        let label = format!("{}{}", RESOURCE_PREFIX, self.resources);
        self.resources += 1;
        label
    }

    /// A fresh `CMP_N` label.
    pub fn compare_label(&mut self) -> String {
        let label = format!("{}{}", COMPARE_PREFIX, self.compares);
        self.compares += 1;
        label
    }

    /// The deferred data sub-stream, placed after the static fields.
    pub fn data(&self) -> &InstructionStream {
        &self.data
    }

    /// The deferred data sub-stream, for appending raw data.
    pub fn data_mut(&mut self) -> &mut InstructionStream {
        &mut self.data
    }

    /// Where `name` lives in the code stream as built so far.
    pub fn label_address(&self, name: &str) -> Result<LabelAddress, AsmError> {
        resolve_label(self.code.instructions(), name)
    }

    // ─── Field layout ──────────────────────────────────────

    /// Make a type's field layout available to [`Assembler::field_offset`].
    pub fn register_type(&mut self, layout: TypeLayout) -> &mut Self {
        self.types.insert(layout.name.clone(), layout);
        self
    }

    /// Byte offset of a `Type::field` within its type.
    pub fn field_offset(&self, field: &str) -> Result<u32, AsmError> {
        let (ty, name) = field
            .rsplit_once("::")
            .ok_or_else(|| AsmError::NotAFieldReference {
                value: String::from(field),
            })?;
        self.types
            .get(ty)
            .and_then(|layout| layout.offset_of(name))
            .ok_or_else(|| AsmError::UnknownField {
                field: String::from(field),
            })
    }

    // ─── Composition ───────────────────────────────────────

    /// Lay out the whole image in the code stream.
    ///
    /// Anything already in the code stream stays in front. The data
    /// sub-stream is moved into place and left empty.
    pub fn compose(&mut self, program: &Program, config: &ImageConfig) -> Result<(), AsmError> {
        if let Some(method) = &self.method {
            if !self.registers.all_free() {
                return Err(AsmError::RegistersNotReleased {
                    method: method.clone(),
                    held: self.registers.in_use(),
                });
            }
        }

        let call_ctor = config
            .static_ctor_label()
            .is_some_and(|ctor| program.has_method(ctor));
        image::emit_multiboot_header(&mut self.code, config);
        image::emit_entry_stub(&mut self.code, config, call_ctor);

        for method in &program.methods {
            debug!(
                "composing '{}' ({} instructions)",
                method.name,
                method.code.len()
            );
            self.code
                .label(method.name.as_str())
                .append_all(method.code.iter().cloned());
        }

        image::emit_helpers(&mut self.code);
        image::emit_statics(&mut self.code, &program.statics);
        let data = core::mem::take(&mut self.data);
        self.code.append_all(data.into_instructions());
        image::emit_tail(&mut self.code, config);

        debug!(
            "composed {} methods, {} statics, {} strings into {} instructions",
            program.methods.len(),
            program.statics.len(),
            self.strings.len(),
            self.code.len()
        );
        Ok(())
    }

    /// Compose the image and encode it. Nothing past the end of the data
    /// area is written.
    pub fn build_image(
        mut self,
        program: &Program,
        config: &ImageConfig,
    ) -> Result<EncodedImage, AsmError> {
        self.compose(program, config)?;
        Linker::new()
            .bss_marker(DATA_END_LABEL)
            .link(self.code.instructions())
    }

    /// Consume the session and return its code stream.
    pub fn into_stream(self) -> InstructionStream {
        self.code
    }
}

impl Deref for Assembler {
    type Target = InstructionStream;

    fn deref(&self) -> &InstructionStream {
        &self.code
    }
}

impl DerefMut for Assembler {
    fn deref_mut(&mut self) -> &mut InstructionStream {
        &mut self.code
    }
}
