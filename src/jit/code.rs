//! Compiled bodies: a flat list of register-machine ops, each tagged with
//! the bytecode offset it came from.
//!
//! Ops work on the compiled frame's locals and operand stack, which keep
//! the interpreter layout. Branch targets are op indices.

use std::sync::Arc;

use crate::vm::method::{Method, MethodId};
use crate::vm::value::ReturnType;

/// Branch condition, comparing against zero or a second operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    #[inline]
    pub fn test(self, a: i32, b: i32) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    IConst(i32),
    LConst(i64),
    /// Push a one-slot local (int or reference).
    Load(usize),
    LoadWide(usize),
    Store(usize),
    StoreWide(usize),
    IInc(usize, i32),

    IAdd,
    ISub,
    IMul,
    /// Traps to the division helper on a zero divisor.
    IDiv,
    IRem,
    INeg,
    IAnd,
    IOr,
    IXor,
    IShl,
    IShr,
    IUShr,

    LAdd,
    LSub,
    LMul,
    LDiv,
    LRem,
    LNeg,
    LAnd,
    LOr,
    LXor,
    LCmp,
    I2L,
    L2I,

    Pop,
    Pop2,
    Dup,

    Goto(usize),
    IfZero(Cond, usize),
    IfICmp(Cond, usize),
    /// Branch when the reference on top is null (`true`) or non-null.
    IfNull(bool, usize),

    /// Call `method` with its arguments on the operand stack. `null_check`
    /// marks a devirtualized instance call whose receiver must be checked.
    Invoke {
        method: Arc<Method>,
        null_check: bool,
    },
    /// Poll async events; placed before every backward branch.
    AsyncCheck,
    Return(ReturnType),
}

/// Output of a compiler.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub ops: Vec<Op>,
    /// Bytecode offset of each op.
    pub pcs: Vec<usize>,
    /// Methods assumed to have no overriders. Defining an overrider
    /// invalidates the body.
    pub assumptions: Vec<MethodId>,
}

impl CompiledCode {
    /// Index of the first op compiled from bytecode offset `pc`.
    pub fn op_index(&self, pc: usize) -> Option<usize> {
        self.pcs.iter().position(|&p| p == pc)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions() {
        assert!(Cond::Lt.test(-1, 0));
        assert!(!Cond::Lt.test(0, 0));
        assert!(Cond::Le.test(0, 0));
        assert!(Cond::Ne.test(i32::MIN, i32::MAX));
    }

    #[test]
    fn test_op_index_finds_first_op_of_pc() {
        let code = CompiledCode {
            ops: vec![Op::IConst(1), Op::AsyncCheck, Op::Goto(0)],
            pcs: vec![0, 1, 1],
            assumptions: Vec::new(),
        };
        assert_eq!(code.op_index(1), Some(1));
        assert_eq!(code.op_index(7), None);
    }
}
