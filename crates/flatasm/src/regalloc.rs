//! Spare-register bookkeeping for method translation.
//!
//! Three scratch registers are available to the instruction selector: EAX,
//! ECX, and EDX, checked out in that order. A register is handed out as a
//! [`SpareRegister`] token that must be given back with
//! [`RegisterPool::release`]; the untyped [`RegisterPool::release_register`]
//! path catches double releases and foreign registers.

use alloc::string::String;

use crate::error::AsmError;
use crate::ir::{OperandSize, Register};

/// Registers in the spare pool, in checkout order.
pub const SPARE_REGISTERS: [Register; 3] = [Register::Eax, Register::Ecx, Register::Edx];

/// A checked-out spare register.
///
/// Not `Clone`: each token stands for exactly one checkout.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a spare register must be released"]
pub struct SpareRegister {
    register: Register,
}

impl SpareRegister {
    /// The checked-out register.
    pub fn register(&self) -> Register {
        self.register
    }
}

/// Indexed bit set over [`SPARE_REGISTERS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterPool {
    used: u8,
    method: Option<String>,
}

impl RegisterPool {
    /// A pool with every register free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the method being translated, for error messages.
    pub fn set_method(&mut self, method: Option<String>) {
        self.method = method;
    }

    fn slot(register: Register) -> Option<usize> {
        SPARE_REGISTERS.iter().position(|r| *r == register)
    }

    /// Check out the first free register.
    pub fn acquire(&mut self) -> Result<SpareRegister, AsmError> {
        let slot = (0..SPARE_REGISTERS.len())
            .find(|i| self.used & (1 << i) == 0)
            .ok_or_else(|| AsmError::RegisterExhausted {
                pool_size: SPARE_REGISTERS.len(),
                method: self.method.clone(),
            })?;
        self.used |= 1 << slot;
        Ok(SpareRegister {
            register: SPARE_REGISTERS[slot],
        })
    }

    /// Give a checked-out register back.
    pub fn release(&mut self, spare: SpareRegister) -> Result<(), AsmError> {
        self.release_register(spare.register)
    }

    /// Give a register back by name.
    pub fn release_register(&mut self, register: Register) -> Result<(), AsmError> {
        let slot = Self::slot(register).ok_or(AsmError::NotASpareRegister { register })?;
        if self.used & (1 << slot) == 0 {
            return Err(AsmError::RegisterAlreadyFree { register });
        }
        self.used &= !(1 << slot);
        Ok(())
    }

    /// Whether `register` is a pool register that is currently free.
    pub fn is_free(&self, register: Register) -> bool {
        Self::slot(register).is_some_and(|slot| self.used & (1 << slot) == 0)
    }

    /// Number of registers checked out.
    pub fn in_use(&self) -> usize {
        self.used.count_ones() as usize
    }

    /// Whether nothing is checked out.
    pub fn all_free(&self) -> bool {
        self.used == 0
    }
}

/// The 8-bit or 16-bit alias of a 32-bit register.
///
/// Only EAX, ECX, EDX, and EBX have both.
pub fn narrow(register: Register, size: OperandSize) -> Result<Register, AsmError> {
    use Register::*;
    let alias = match (register, size) {
        (Eax, OperandSize::Byte) => Al,
        (Ecx, OperandSize::Byte) => Cl,
        (Edx, OperandSize::Byte) => Dl,
        (Ebx, OperandSize::Byte) => Bl,
        (Eax, OperandSize::Word) => Ax,
        (Ecx, OperandSize::Word) => Cx,
        (Edx, OperandSize::Word) => Dx,
        (Ebx, OperandSize::Word) => Bx,
        _ => {
            return Err(AsmError::NoNarrowAlias {
                register,
                bits: size.bits(),
            })
        }
    };
    Ok(alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_in_order_then_exhaust() {
        let mut pool = RegisterPool::new();
        let a = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let d = pool.acquire().unwrap();
        assert_eq!(
            [a.register(), c.register(), d.register()],
            [Register::Eax, Register::Ecx, Register::Edx]
        );
        assert_eq!(pool.in_use(), 3);
        assert_eq!(
            pool.acquire(),
            Err(AsmError::RegisterExhausted {
                pool_size: 3,
                method: None
            })
        );
        pool.release(a).unwrap();
        pool.release(c).unwrap();
        pool.release(d).unwrap();
        assert!(pool.all_free());
    }

    #[test]
    fn exhaustion_names_the_method() {
        let mut pool = RegisterPool::new();
        pool.set_method(Some("Kernel::Main".into()));
        let _held = [
            pool.acquire().unwrap(),
            pool.acquire().unwrap(),
            pool.acquire().unwrap(),
        ];
        let err = pool.acquire().unwrap_err();
        assert_eq!(
            format!("{}", err),
            "no spare registers left (3 in pool) while translating 'Kernel::Main'"
        );
    }

    #[test]
    fn released_register_is_reused_first() {
        let mut pool = RegisterPool::new();
        let a = pool.acquire().unwrap();
        let _c = pool.acquire().unwrap();
        pool.release(a).unwrap();
        assert!(pool.is_free(Register::Eax));
        assert!(!pool.is_free(Register::Ecx));
        assert_eq!(pool.acquire().unwrap().register(), Register::Eax);
    }

    #[test]
    fn double_release_fails() {
        let mut pool = RegisterPool::new();
        let c = pool.acquire().unwrap();
        let reg = c.register();
        pool.release(c).unwrap();
        let err = pool.release_register(reg).unwrap_err();
        assert_eq!(err, AsmError::RegisterAlreadyFree { register: Register::Eax });
        assert_eq!(format!("{}", err), "eax is already free");
    }

    #[test]
    fn foreign_register_is_rejected() {
        let mut pool = RegisterPool::new();
        assert_eq!(
            pool.release_register(Register::Ebx),
            Err(AsmError::NotASpareRegister {
                register: Register::Ebx
            })
        );
        assert!(!pool.is_free(Register::Ebx));
    }

    #[test]
    fn narrowing_table() {
        assert_eq!(narrow(Register::Eax, OperandSize::Byte).unwrap(), Register::Al);
        assert_eq!(narrow(Register::Ebx, OperandSize::Byte).unwrap(), Register::Bl);
        assert_eq!(narrow(Register::Edx, OperandSize::Word).unwrap(), Register::Dx);
        assert_eq!(
            narrow(Register::Esi, OperandSize::Byte),
            Err(AsmError::NoNarrowAlias {
                register: Register::Esi,
                bits: 8
            })
        );
        assert!(narrow(Register::Eax, OperandSize::Dword).is_err());
    }
}
