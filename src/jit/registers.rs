//! The simulated register file compiled bodies run against.
//!
//! Compiled code gets its arguments in registers, returns results in
//! `gpr[0]`/`fpr[0]` and keeps its own state in the callee-saved set. A J2I
//! frame stores the callee-saved registers in [`CALLEE_SAVED`] order and
//! puts them back when control returns to compiled code.

use crate::vm::value::{ReturnType, Word};

pub const GPR_COUNT: usize = 16;
pub const FPR_COUNT: usize = 16;

/// Integer/reference argument registers, in argument order.
pub const ARGUMENT_GPRS: [usize; 6] = [1, 2, 3, 4, 5, 6];
/// Float/double argument registers, in argument order.
pub const ARGUMENT_FPRS: [usize; 4] = [0, 1, 2, 3];

pub const RETURN_GPR: usize = 0;
pub const RETURN_FPR: usize = 0;

pub const CALLEE_SAVED_COUNT: usize = 8;

/// Callee-saved general registers, in the order J2I frames store them.
pub const CALLEE_SAVED: [usize; CALLEE_SAVED_COUNT] = [8, 9, 10, 11, 12, 13, 14, 15];

/// Holds the base of the running compiled frame.
pub const FRAME_BASE_REGISTER: usize = CALLEE_SAVED[0];
/// Holds the entry of the running compiled body.
pub const ENTRY_REGISTER: usize = CALLEE_SAVED[1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitRegisterFile {
    pub gpr: [Word; GPR_COUNT],
    pub fpr: [Word; FPR_COUNT],
}

impl Default for JitRegisterFile {
    fn default() -> Self {
        JitRegisterFile {
            gpr: [0; GPR_COUNT],
            fpr: [0; FPR_COUNT],
        }
    }
}

impl JitRegisterFile {
    pub fn save_callee_saved(&self) -> [Word; CALLEE_SAVED_COUNT] {
        let mut saved = [0; CALLEE_SAVED_COUNT];
        for (slot, &reg) in saved.iter_mut().zip(CALLEE_SAVED.iter()) {
            *slot = self.gpr[reg];
        }
        saved
    }

    pub fn restore_callee_saved(&mut self, saved: &[Word; CALLEE_SAVED_COUNT]) {
        for (&word, &reg) in saved.iter().zip(CALLEE_SAVED.iter()) {
            self.gpr[reg] = word;
        }
    }

    /// Clobber every caller-saved register. Models a call that does not
    /// preserve them.
    pub fn clobber_volatile(&mut self) {
        for (i, reg) in self.gpr.iter_mut().enumerate() {
            if !CALLEE_SAVED.contains(&i) {
                *reg = 0xdead_beef_dead_beef;
            }
        }
        self.fpr = [0xdead_beef_dead_beef; FPR_COUNT];
    }

    /// Read the return value for `ret` from its register class.
    pub fn return_value(&self, ret: ReturnType) -> Word {
        match ret {
            ReturnType::Void => 0,
            ReturnType::Float | ReturnType::Double => self.fpr[RETURN_FPR],
            _ => self.gpr[RETURN_GPR],
        }
    }
}
