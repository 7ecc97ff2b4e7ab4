//! Running compiled bodies.
//!
//! A compiled body executes its ops against a compiled frame on the Java
//! stack. Calls between compiled bodies (j2j) stay inside one executor run
//! and never recurse on the Rust stack; calls into anything else go
//! through the j2i bridge. Anything that may create an exception or walk
//! the stack runs inside a JIT resolve frame with the current bytecode
//! offset published, so traces name the compiled method and its line.
//!
//! After every call the caller's body is checked: a body invalidated while
//! the call was running is turned into an interpreter frame in place and
//! the rest of the method is interpreted.

use std::sync::Arc;

use tracing::{debug, trace};

use super::TransitionCounters;
use super::bridge::J2IOutcome;
use super::code::Op;
use super::code_cache::CompiledBody;
use super::marshal::{home_arguments, marshal_arguments, set_return_register};
use super::registers::{CALLEE_SAVED_COUNT, ENTRY_REGISTER, FRAME_BASE_REGISTER};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::fixed_length;
use crate::vm::exception::ThrowableKind;
use crate::vm::frame::{
    COMPILED_FRAME_WORDS, JitResolveState, build_compiled_frame, build_jit_resolve_frame,
    compiled_locals, materialize_interpreter_frame, restore_compiled_frame,
    restore_jit_resolve_frame, set_compiled_frame_pc,
};
use crate::vm::interpreter::{int_div, int_rem, long_div, long_rem};
use crate::vm::method::Method;
use crate::vm::run_target::CountOutcome;
use crate::vm::value::{ObjectRef, ReturnType, Word};
use crate::vm::vm_thread::VmThread;

/// How a run of compiled code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompiledExit {
    /// The outermost body returned; its result is in the return register
    /// and its arguments are still on the caller's operand stack.
    Returned,
    /// The outermost body was deoptimized. Its interpreter frame is on top
    /// and resumes after the call that returned into it.
    Deoptimized,
    /// An exception is pending and every compiled frame has been popped.
    Threw,
}

/// One compiled frame of the current run.
struct Activation {
    method: Arc<Method>,
    body: Arc<CompiledBody>,
    /// Frame base, which is `a0` while the body runs.
    bp: usize,
    /// Index of the op being executed.
    ip: usize,
    /// Caller's callee-saved registers, restored when this frame returns.
    saved: [Word; CALLEE_SAVED_COUNT],
}

impl Activation {
    fn locals(&self) -> usize {
        compiled_locals(&self.method, self.bp)
    }

    fn pc(&self) -> usize {
        self.body.code.pcs.get(self.ip).copied().unwrap_or(0)
    }
}

enum Flow {
    Next,
    Jump(usize),
    Call { method: Arc<Method>, null_check: bool },
    Return(ReturnType),
    Trap(BytecodeAction),
}

impl VmThread {
    /// Run `body` with its method's arguments on the operand stack.
    pub(crate) fn run_compiled(&mut self, body: Arc<CompiledBody>) -> CompiledExit {
        let mut frames = match self.enter_body(body) {
            Ok(frame) => vec![frame],
            Err(action) => {
                self.raise(action);
                return CompiledExit::Threw;
            }
        };

        loop {
            let Some(frame) = frames.last_mut() else {
                return CompiledExit::Returned;
            };
            let flow = self.execute_op(frame);
            match flow {
                Flow::Next => frame.ip += 1,
                Flow::Jump(target) => frame.ip = target,
                Flow::Trap(action) => return self.unwind_compiled(&mut frames, action),
                Flow::Return(ret) => {
                    let Some(done) = frames.pop() else {
                        return CompiledExit::Returned;
                    };
                    let value = match ret.slots() {
                        0 => 0,
                        1 => self.ctx.pop(),
                        _ => self.ctx.pop_wide(),
                    };
                    set_return_register(&mut self.regs, ret, value);
                    restore_compiled_frame(&mut self.ctx, &done.method, done.bp);
                    self.regs.restore_callee_saved(&done.saved);
                    trace!(target: "jexec::jit", method = %done.method.full_name(), "compiled return");
                    if frames.is_empty() {
                        return CompiledExit::Returned;
                    }
                    self.ctx.sp += done.method.arg_slots;
                    (self.vm.jit.trampolines.get(ret))(&mut self.ctx, &self.regs);
                    if let Some(exit) = self.after_call(&mut frames) {
                        return exit;
                    }
                }
                Flow::Call { method, null_check } => {
                    if null_check && self.ctx.peek_ref(method.arg_slots - 1).is_null() {
                        return self.unwind_compiled(&mut frames, BytecodeAction::ThrowNullPointer);
                    }
                    if let Some(exit) = self.call_from_compiled(&mut frames, method) {
                        return exit;
                    }
                }
            }
        }
    }

    /// Marshal the arguments on the operand stack into registers and push a
    /// compiled frame for `body`, homing them into their local slots.
    fn enter_body(&mut self, body: Arc<CompiledBody>) -> Result<Activation, BytecodeAction> {
        let method = Arc::clone(&body.method);
        if let Some(action) = self.check_stack(method.stack_use() + COMPILED_FRAME_WORDS) {
            return Err(action);
        }
        let args = self.ctx.sp + method.arg_slots - 1;
        marshal_arguments(&self.ctx, &method, args, &mut self.regs);
        let saved = self.regs.save_callee_saved();
        let bp = build_compiled_frame(&mut self.ctx, &method, body.entry);
        home_arguments(&mut self.ctx, &method, compiled_locals(&method, bp), &self.regs);
        self.regs.gpr[FRAME_BASE_REGISTER] = bp as Word;
        self.regs.gpr[ENTRY_REGISTER] = body.entry as Word;
        trace!(target: "jexec::jit", method = %method.full_name(), entry = body.entry, "compiled entry");
        Ok(Activation {
            method,
            body,
            bp,
            ip: 0,
            saved,
        })
    }

    fn execute_op(&mut self, frame: &Activation) -> Flow {
        let Some(op) = frame.body.code.ops.get(frame.ip) else {
            return Flow::Trap(BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!("compiled code of {} ran off its end", frame.method.full_name()),
            ));
        };
        let locals = frame.locals();
        let ctx = &mut self.ctx;
        match op {
            Op::IConst(v) => ctx.push_int(*v),
            Op::LConst(v) => ctx.push_long(*v),
            Op::Load(i) => ctx.push(ctx.stack.read(locals - i)),
            Op::LoadWide(i) => ctx.push_wide(ctx.stack.read(locals - i - 1)),
            Op::Store(i) => {
                let word = ctx.pop();
                ctx.stack.write(locals - i, word);
            }
            Op::StoreWide(i) => {
                let word = ctx.pop_wide();
                ctx.stack.write(locals - i - 1, word);
            }
            Op::IInc(i, delta) => {
                let value = (ctx.stack.read(locals - i) as u32 as i32).wrapping_add(*delta);
                ctx.stack.write(locals - i, value as u32 as Word);
            }

            Op::IAdd => int_op(ctx, i32::wrapping_add),
            Op::ISub => int_op(ctx, i32::wrapping_sub),
            Op::IMul => int_op(ctx, i32::wrapping_mul),
            Op::IDiv | Op::IRem => {
                let b = ctx.pop_int();
                let a = ctx.pop_int();
                let result = if matches!(op, Op::IDiv) { int_div(a, b) } else { int_rem(a, b) };
                match result {
                    Some(v) => ctx.push_int(v),
                    None => return Flow::Trap(BytecodeAction::ThrowArithmetic),
                }
            }
            Op::INeg => {
                let v = ctx.pop_int();
                ctx.push_int(v.wrapping_neg());
            }
            Op::IAnd => int_op(ctx, |a, b| a & b),
            Op::IOr => int_op(ctx, |a, b| a | b),
            Op::IXor => int_op(ctx, |a, b| a ^ b),
            Op::IShl => int_op(ctx, |a, b| a.wrapping_shl(b as u32)),
            Op::IShr => int_op(ctx, |a, b| a.wrapping_shr(b as u32)),
            Op::IUShr => int_op(ctx, |a, b| (a as u32).wrapping_shr(b as u32) as i32),

            Op::LAdd => long_op(ctx, i64::wrapping_add),
            Op::LSub => long_op(ctx, i64::wrapping_sub),
            Op::LMul => long_op(ctx, i64::wrapping_mul),
            Op::LDiv | Op::LRem => {
                let b = ctx.pop_long();
                let a = ctx.pop_long();
                let result = if matches!(op, Op::LDiv) { long_div(a, b) } else { long_rem(a, b) };
                match result {
                    Some(v) => ctx.push_long(v),
                    None => return Flow::Trap(BytecodeAction::ThrowArithmetic),
                }
            }
            Op::LNeg => {
                let v = ctx.pop_long();
                ctx.push_long(v.wrapping_neg());
            }
            Op::LAnd => long_op(ctx, |a, b| a & b),
            Op::LOr => long_op(ctx, |a, b| a | b),
            Op::LXor => long_op(ctx, |a, b| a ^ b),
            Op::LCmp => {
                let b = ctx.pop_long();
                let a = ctx.pop_long();
                ctx.push_int(a.cmp(&b) as i32);
            }
            Op::I2L => {
                let v = ctx.pop_int();
                ctx.push_long(v as i64);
            }
            Op::L2I => {
                let v = ctx.pop_long();
                ctx.push_int(v as i32);
            }

            Op::Pop => ctx.sp += 1,
            Op::Pop2 => ctx.sp += 2,
            Op::Dup => ctx.push(ctx.peek(0)),

            Op::Goto(target) => return Flow::Jump(*target),
            Op::IfZero(cond, target) => {
                let v = ctx.pop_int();
                if cond.test(v, 0) {
                    return Flow::Jump(*target);
                }
            }
            Op::IfICmp(cond, target) => {
                let b = ctx.pop_int();
                let a = ctx.pop_int();
                if cond.test(a, b) {
                    return Flow::Jump(*target);
                }
            }
            Op::IfNull(when_null, target) => {
                if ObjectRef::from_word(ctx.pop()).is_null() == *when_null {
                    return Flow::Jump(*target);
                }
            }

            Op::Invoke { method, null_check } => {
                return Flow::Call {
                    method: Arc::clone(method),
                    null_check: *null_check,
                };
            }
            Op::AsyncCheck => {
                if self.shared.async_flags() != 0 {
                    let action = self.compiled_helper(frame, |thread| thread.process_async_events(false));
                    if action != BytecodeAction::ExecuteBytecode {
                        return Flow::Trap(action);
                    }
                }
            }
            Op::Return(ret) => return Flow::Return(*ret),
        }
        Flow::Next
    }

    /// Run `helper` from compiled code: publish the current bytecode offset
    /// and cover the compiled frame with a JIT resolve frame.
    fn compiled_helper<T>(&mut self, frame: &Activation, helper: impl FnOnce(&mut Self) -> T) -> T {
        set_compiled_frame_pc(&mut self.ctx, frame.bp, frame.pc());
        let state = JitResolveState {
            saved_exception: self.exception,
            flags: 0,
            parm_count: 0,
            return_address: frame.ip as Word,
            return_sp: self.ctx.sp,
        };
        let bp = build_jit_resolve_frame(&mut self.ctx, &state);
        let result = helper(self);
        restore_jit_resolve_frame(&mut self.ctx, bp);
        result
    }

    /// Call `callee` from the compiled frame on top: directly when it has
    /// compiled code, through a J2I frame otherwise.
    fn call_from_compiled(
        &mut self,
        frames: &mut Vec<Activation>,
        callee: Arc<Method>,
    ) -> Option<CompiledExit> {
        let Some(frame) = frames.last() else {
            return Some(CompiledExit::Returned);
        };
        set_compiled_frame_pc(&mut self.ctx, frame.bp, frame.pc());
        let return_address = (frame.ip + 1) as Word;

        let entry = match callee.run_target.count_invocation() {
            CountOutcome::Compiled(entry) => Some(entry),
            outcome => match self.j2i_call(&callee, outcome, return_address) {
                J2IOutcome::Returned => {
                    self.ctx.sp += callee.arg_slots;
                    (self.vm.jit.trampolines.get(callee.return_type()))(&mut self.ctx, &self.regs);
                    return self.after_call(frames);
                }
                J2IOutcome::Redirect(entry) => Some(entry),
                J2IOutcome::Threw => {
                    return Some(self.unwind_compiled(frames, BytecodeAction::ThrowCurrentException));
                }
                J2IOutcome::Trap(action) => return Some(self.unwind_compiled(frames, action)),
            },
        };

        let body = entry
            .and_then(|entry| self.vm.jit.code_cache.body(entry))
            .filter(|body| !body.is_invalidated());
        let Some(body) = body else {
            return match self.j2i_call(&callee, CountOutcome::Interpret, return_address) {
                J2IOutcome::Returned | J2IOutcome::Redirect(_) => {
                    self.ctx.sp += callee.arg_slots;
                    (self.vm.jit.trampolines.get(callee.return_type()))(&mut self.ctx, &self.regs);
                    self.after_call(frames)
                }
                J2IOutcome::Threw => Some(self.unwind_compiled(frames, BytecodeAction::ThrowCurrentException)),
                J2IOutcome::Trap(action) => Some(self.unwind_compiled(frames, action)),
            };
        };

        match self.enter_body(body) {
            Ok(callee_frame) => {
                TransitionCounters::bump(&self.vm.jit.counters.j2j);
                if self.vm.jit.trace {
                    debug!(target: "jexec::jit", callee = %callee.full_name(), "j2j call");
                }
                frames.push(callee_frame);
                None
            }
            Err(action) => Some(self.unwind_compiled(frames, action)),
        }
    }

    /// The call made by the frame on top returned. Continue after the
    /// invoke, or deoptimize when the body was invalidated meanwhile.
    fn after_call(&mut self, frames: &mut Vec<Activation>) -> Option<CompiledExit> {
        let frame = frames.last_mut()?;
        if !frame.body.is_invalidated() {
            frame.ip += 1;
            return None;
        }

        let pc = frame.pc();
        let length = frame.method.code.get(pc).and_then(|&op| fixed_length(op)).unwrap_or(3);
        set_compiled_frame_pc(&mut self.ctx, frame.bp, pc + length);
        materialize_interpreter_frame(&mut self.ctx, &frame.method, frame.bp);
        self.regs.restore_callee_saved(&frame.saved);
        TransitionCounters::bump(&self.vm.jit.counters.deoptimizations);
        debug!(
            target: "jexec::jit",
            method = %frame.method.full_name(),
            pc = pc + length,
            "deoptimized"
        );
        frames.pop();
        if frames.is_empty() {
            return Some(CompiledExit::Deoptimized);
        }

        // The interpreted frame returns straight onto the compiled caller's
        // operand stack.
        self.run(BytecodeAction::ExecuteBytecode);
        if !self.exception.is_null() {
            return Some(self.unwind_compiled(frames, BytecodeAction::ThrowCurrentException));
        }
        self.after_call(frames)
    }

    /// Raise `action` from the frame on top and pop every compiled frame.
    /// Compiled bodies have no handlers, so the exception always leaves
    /// this run.
    fn unwind_compiled(&mut self, frames: &mut Vec<Activation>, action: BytecodeAction) -> CompiledExit {
        if let Some(frame) = frames.last() {
            self.compiled_helper(frame, |thread| thread.raise(action));
        } else {
            self.raise(action);
        }
        if self.exception.is_null() {
            self.exception = self.create_exception(
                ThrowableKind::InternalError,
                Some("compiled code trapped without an exception".to_string()),
            );
        }
        while let Some(frame) = frames.pop() {
            restore_compiled_frame(&mut self.ctx, &frame.method, frame.bp);
            self.regs.restore_callee_saved(&frame.saved);
            trace!(target: "jexec::jit", method = %frame.method.full_name(), "compiled frame unwound");
        }
        CompiledExit::Threw
    }
}

#[inline]
fn int_op(ctx: &mut crate::vm::context::ExecutionContext, f: impl FnOnce(i32, i32) -> i32) {
    let b = ctx.pop_int();
    let a = ctx.pop_int();
    ctx.push_int(f(a, b));
}

#[inline]
fn long_op(ctx: &mut crate::vm::context::ExecutionContext, f: impl FnOnce(i64, i64) -> i64) {
    let b = ctx.pop_long();
    let a = ctx.pop_long();
    ctx.push_long(f(a, b));
}
