//! The execution context: the four interpreter registers plus the stack they
//! point into.
//!
//! * `sp`: top of the operand stack (lowest used address; the stack grows down)
//! * `a0`: frame base, the address of argument slot 0; local `i` lives at
//!   `a0 - i`
//! * `pc`: biased bytecode offset in the current method, or a frame-type
//!   sentinel below [`SPECIAL_FRAME_TYPE_LIMIT`] while a special frame is on top
//! * `literals`: the method whose constant pool is in use
//!
//! Together they describe a suspendable execution point exactly; every frame
//! saves and restores all four.

use super::frame::{PC_BIAS, SPECIAL_FRAME_TYPE_LIMIT};
use super::method::MethodId;
use super::stack::JavaStack;
use super::value::{
    JValue, ObjectRef, ReturnType, Word, float_to_word, int_to_word, word_to_float, word_to_int,
};

/// Snapshot of the four registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub sp: usize,
    pub a0: usize,
    pub pc: usize,
    pub literals: Option<MethodId>,
}

pub struct ExecutionContext {
    pub sp: usize,
    pub a0: usize,
    pub pc: usize,
    pub literals: Option<MethodId>,
    pub stack: JavaStack,
}

impl ExecutionContext {
    /// Fresh context on an empty stack of `capacity` words.
    pub fn new(capacity: usize) -> Self {
        let stack = JavaStack::new(capacity);
        let end = stack.end();
        ExecutionContext {
            sp: end,
            a0: end - 1,
            pc: 0,
            literals: None,
            stack,
        }
    }

    #[inline]
    pub fn registers(&self) -> Registers {
        Registers {
            sp: self.sp,
            a0: self.a0,
            pc: self.pc,
            literals: self.literals,
        }
    }

    pub fn set_registers(&mut self, regs: Registers) {
        self.sp = regs.sp;
        self.a0 = regs.a0;
        self.pc = regs.pc;
        self.literals = regs.literals;
    }

    /// Whether the top of stack is a special frame rather than bytecode.
    #[inline]
    pub fn in_special_frame(&self) -> bool {
        self.pc < SPECIAL_FRAME_TYPE_LIMIT
    }

    /// Current bytecode offset. Only meaningful in an interpreted frame.
    #[inline(always)]
    pub fn bytecode_pc(&self) -> usize {
        self.pc - PC_BIAS
    }

    #[inline(always)]
    pub fn set_bytecode_pc(&mut self, offset: usize) {
        self.pc = offset + PC_BIAS;
    }

    #[inline(always)]
    pub fn advance(&mut self, len: usize) {
        self.pc += len;
    }

    /// Number of words currently on the stack.
    pub fn depth(&self) -> usize {
        self.stack.used(self.sp)
    }

    // =========================================================================
    // Operand stack
    // =========================================================================

    #[inline(always)]
    pub fn push(&mut self, word: Word) {
        self.sp -= 1;
        self.stack.write(self.sp, word);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Word {
        let word = self.stack.read(self.sp);
        self.sp += 1;
        word
    }

    /// Slot `n` counted from the top (0 = top).
    #[inline(always)]
    pub fn peek(&self, n: usize) -> Word {
        self.stack.read(self.sp + n)
    }

    #[inline(always)]
    pub fn poke(&mut self, n: usize, word: Word) {
        self.stack.write(self.sp + n, word);
    }

    #[inline(always)]
    pub fn push_int(&mut self, v: i32) {
        self.push(int_to_word(v));
    }

    #[inline(always)]
    pub fn pop_int(&mut self) -> i32 {
        word_to_int(self.pop())
    }

    #[inline(always)]
    pub fn push_float(&mut self, v: f32) {
        self.push(float_to_word(v));
    }

    #[inline(always)]
    pub fn pop_float(&mut self) -> f32 {
        word_to_float(self.pop())
    }

    #[inline(always)]
    pub fn push_ref(&mut self, r: ObjectRef) {
        self.push(r.to_word());
    }

    #[inline(always)]
    pub fn pop_ref(&mut self) -> ObjectRef {
        ObjectRef::from_word(self.pop())
    }

    #[inline(always)]
    pub fn peek_ref(&self, n: usize) -> ObjectRef {
        ObjectRef::from_word(self.peek(n))
    }

    /// Push a two-slot value; the value lives in the lower slot.
    #[inline(always)]
    pub fn push_wide(&mut self, word: Word) {
        self.sp -= 2;
        self.stack.write(self.sp + 1, 0);
        self.stack.write(self.sp, word);
    }

    #[inline(always)]
    pub fn pop_wide(&mut self) -> Word {
        let word = self.stack.read(self.sp);
        self.sp += 2;
        word
    }

    #[inline(always)]
    pub fn push_long(&mut self, v: i64) {
        self.push_wide(v as u64);
    }

    #[inline(always)]
    pub fn pop_long(&mut self) -> i64 {
        self.pop_wide() as i64
    }

    #[inline(always)]
    pub fn push_double(&mut self, v: f64) {
        self.push_wide(v.to_bits());
    }

    #[inline(always)]
    pub fn pop_double(&mut self) -> f64 {
        f64::from_bits(self.pop_wide())
    }

    /// Push `value` in its own category; `Void` pushes nothing.
    pub fn push_value(&mut self, value: JValue) {
        match value.to_slots() {
            (_, 0) => {}
            ([word, _], 1) => self.push(word),
            ([word, _], _) => self.push_wide(word),
        }
    }

    /// Pop a value of category `ty`.
    pub fn pop_value(&mut self, ty: ReturnType) -> JValue {
        match ty.slots() {
            0 => JValue::Void,
            1 => JValue::from_word(ty, self.pop()),
            _ => JValue::from_word(ty, self.pop_wide()),
        }
    }

    // =========================================================================
    // Locals
    // =========================================================================

    #[inline(always)]
    pub fn local(&self, index: usize) -> Word {
        self.stack.read(self.a0 - index)
    }

    #[inline(always)]
    pub fn set_local(&mut self, index: usize, word: Word) {
        self.stack.write(self.a0 - index, word);
    }

    /// Two-slot local starting at `index`; the value is in the lower slot.
    #[inline(always)]
    pub fn local_wide(&self, index: usize) -> Word {
        self.stack.read(self.a0 - index - 1)
    }

    #[inline(always)]
    pub fn set_local_wide(&mut self, index: usize, word: Word) {
        self.stack.write(self.a0 - index - 1, word);
        self.stack.write(self.a0 - index, 0);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("sp", &self.sp)
            .field("a0", &self.a0)
            .field("pc", &self.pc)
            .field("literals", &self.literals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_values_use_lower_slot() {
        let mut ctx = ExecutionContext::new(16);
        ctx.push_int(1);
        ctx.push_long(-5);
        assert_eq!(ctx.peek(0) as i64, -5);
        assert_eq!(ctx.peek(1), 0);
        assert_eq!(ctx.pop_long(), -5);
        assert_eq!(ctx.pop_int(), 1);
    }

    #[test]
    fn test_locals_at_negative_offsets() {
        let mut ctx = ExecutionContext::new(16);
        ctx.push_int(7); // arg 0
        ctx.push_long(9); // args 1-2
        ctx.a0 = ctx.sp + 2;
        assert_eq!(word_to_int(ctx.local(0)), 7);
        assert_eq!(ctx.local_wide(1) as i64, 9);
        ctx.set_local_wide(1, 11);
        assert_eq!(ctx.pop_long(), 11);
    }

    #[test]
    fn test_double_bits_preserved() {
        let mut ctx = ExecutionContext::new(8);
        ctx.push_double(f64::NAN);
        assert!(ctx.pop_double().is_nan());
        ctx.push_float(-0.0);
        assert_eq!(ctx.pop_float().to_bits(), (-0.0f32).to_bits());
    }
}
