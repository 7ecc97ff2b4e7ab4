//! Transitions between interpreted and compiled code.
//!
//! * **i2j**: an interpreted invoke whose target has compiled code. The
//!   interpreter registers are stashed, the body runs, and the return
//!   trampoline for the callee's return type moves the result from its
//!   return register onto the interpreter's operand stack.
//! * **j2i**: compiled code calling something without compiled code. A J2I
//!   frame records the callee-saved registers, the i2j state of the
//!   compiled region and the return address, then the interpreter runs the
//!   callee. A callee that becomes due for compilation is compiled on the
//!   spot and the return address is patched so the compiled caller calls
//!   the new body directly instead.

use std::sync::Arc;

use tracing::{debug, warn};

use super::TransitionCounters;
use super::executor::CompiledExit;
use crate::vm::action::BytecodeAction;
use crate::vm::exception::ThrowableKind;
use crate::vm::frame::{
    I2JState, J2IState, J2I_FRAME_WORDS, build_j2i_frame, patch_j2i_return_address,
    restore_j2i_frame,
};
use crate::vm::method::Method;
use crate::vm::run_target::{CountOutcome, RunState, SendTarget};
use crate::vm::value::Word;
use crate::vm::vm_thread::VmThread;

/// How a j2i call came back to compiled code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum J2IOutcome {
    /// The callee returned; its result is in the return register and its
    /// arguments are still on the caller's operand stack.
    Returned,
    /// An exception is pending.
    Threw,
    /// The callee was compiled instead of run. Call this entry.
    Redirect(usize),
    /// The call could not be made.
    Trap(BytecodeAction),
}

impl VmThread {
    /// `I2JTransition`: run the staged method's compiled body.
    pub(crate) fn i2j_transition(&mut self) -> BytecodeAction {
        let Some(method) = self.send_method.take() else {
            return BytecodeAction::linkage(ThrowableKind::InternalError, "no method staged");
        };
        let body = match method.run_target.load() {
            RunState::Compiled(entry) => self.vm.jit.code_cache.body(entry),
            _ => None,
        };
        let Some(body) = body.filter(|body| !body.is_invalidated()) else {
            return self.enter_interpreted(&method);
        };

        let state = I2JState {
            return_sp: self.ctx.sp,
            a0: self.ctx.a0,
            literals: self.ctx.literals,
            pc: self.ctx.pc,
        };
        let previous = self.i2j.replace(state);
        TransitionCounters::bump(&self.vm.jit.counters.i2j);
        if self.vm.jit.trace {
            debug!(target: "jexec::jit", method = %method.full_name(), entry = body.entry, "i2j");
        }

        let exit = self.run_compiled(body);
        self.i2j = previous;
        match exit {
            CompiledExit::Returned => {
                debug_assert_eq!((self.ctx.sp, self.ctx.a0, self.ctx.pc), (state.return_sp, state.a0, state.pc));
                self.ctx.sp += method.arg_slots;
                (self.vm.jit.trampolines.get(method.return_type()))(&mut self.ctx, &self.regs);
                self.resume_caller()
            }
            CompiledExit::Deoptimized => BytecodeAction::ExecuteBytecode,
            CompiledExit::Threw => BytecodeAction::ThrowCurrentException,
        }
    }

    /// Call `callee`, whose arguments are on the compiled caller's operand
    /// stack, through the interpreter. `outcome` is what counting the
    /// invocation decided.
    pub(crate) fn j2i_call(
        &mut self,
        callee: &Arc<Method>,
        outcome: CountOutcome,
        return_address: Word,
    ) -> J2IOutcome {
        if let Some(action) = self.check_stack(J2I_FRAME_WORDS + callee.arg_slots) {
            return J2IOutcome::Trap(action);
        }
        let args = self.ctx.sp;
        let state = J2IState {
            i2j: self.i2j.take(),
            previous_j2i: self.j2i_top,
            callee_saved: self.regs.save_callee_saved(),
            flags: 0,
            exit_point: self.ctx.pc as Word,
            return_address,
            return_sp: args,
        };
        let bp = build_j2i_frame(&mut self.ctx, &state);
        self.j2i_top = bp;

        if matches!(outcome, CountOutcome::TriggerCompile) {
            if let Some(entry) = self.compile_method(callee) {
                patch_j2i_return_address(&mut self.ctx, bp, entry as Word);
                let left = self.leave_j2i(bp);
                TransitionCounters::bump(&self.vm.jit.counters.j2i_redirects);
                debug!(
                    target: "jexec::jit",
                    callee = %callee.full_name(),
                    entry,
                    "j2i redirected to new compiled body"
                );
                return J2IOutcome::Redirect(left.return_address as usize);
            }
        }

        TransitionCounters::bump(&self.vm.jit.counters.j2i);
        if self.vm.jit.trace {
            debug!(target: "jexec::jit", callee = %callee.full_name(), "j2i");
        }
        for i in (0..callee.arg_slots).rev() {
            let word = self.ctx.stack.read(args + i);
            self.ctx.push(word);
        }
        self.send_method = Some(Arc::clone(callee));
        self.send_precounted = true;
        self.run(BytecodeAction::RunMethod);

        let threw = !self.exception.is_null();
        let value = if threw {
            0
        } else {
            match callee.return_type().slots() {
                0 => 0,
                1 => self.ctx.pop(),
                _ => self.ctx.pop_wide(),
            }
        };
        self.leave_j2i(bp);
        if threw {
            return J2IOutcome::Threw;
        }
        self.regs.clobber_volatile();
        super::marshal::set_return_register(&mut self.regs, callee.return_type(), value);
        J2IOutcome::Returned
    }

    /// Pop the J2I frame at `bp` and put back what it saved.
    fn leave_j2i(&mut self, bp: usize) -> J2IState {
        let state = restore_j2i_frame(&mut self.ctx, bp);
        self.i2j = state.i2j;
        self.j2i_top = state.previous_j2i;
        self.regs.restore_callee_saved(&state.callee_saved);
        state
    }

    /// Compile `method`, whose run target this thread moved to `Compiling`,
    /// and publish the result. Returns the new entry. A method that cannot
    /// be compiled is interpreted from now on.
    pub(crate) fn compile_method(&mut self, method: &Arc<Method>) -> Option<usize> {
        let compiling = RunState::Send(SendTarget::Compiling);
        let interpreted = RunState::Send(SendTarget::Interpreted);
        let jit = &self.vm.jit;
        let Some(compiler) = jit.compiler.as_deref() else {
            let _ = method.run_target.compare_exchange(compiling, interpreted);
            return None;
        };
        if method.is_synchronized() {
            let _ = method.run_target.compare_exchange(compiling, interpreted);
            debug!(target: "jexec::jit", method = %method.full_name(), "synchronized method stays interpreted");
            return None;
        }

        let epoch = self.vm.hierarchy_epoch();
        let installed = compiler
            .compile(&self.vm, method)
            .and_then(|code| jit.code_cache.install(Arc::clone(method), code));
        match installed {
            Ok(entry) => {
                TransitionCounters::bump(&jit.counters.compiles);
                let recount = self.vm.config.jit_threshold;
                // Classes defined during the compile never saw this body.
                if self.vm.hierarchy_epoch() != epoch && self.assumptions_broken(entry) {
                    jit.code_cache.invalidate_entry(entry, &jit.counters);
                }
                if self.body_invalidated(entry) {
                    let _ = method
                        .run_target
                        .compare_exchange(compiling, RunState::Counting(recount));
                    return None;
                }
                if !method.run_target.compare_exchange(compiling, RunState::Compiled(entry)) {
                    debug!(target: "jexec::jit", method = %method.full_name(), "run target moved while compiling");
                    return None;
                }
                // Invalidated between the check and the publish: the walk
                // could not reset a run target that was still `Compiling`.
                if self.body_invalidated(entry) {
                    method.run_target.invalidate(entry, recount);
                    return None;
                }
                debug!(
                    target: "jexec::jit",
                    method = %method.full_name(),
                    compiler = compiler.name(),
                    entry,
                    "compiled"
                );
                Some(entry)
            }
            Err(error) => {
                TransitionCounters::bump(&jit.counters.compile_failures);
                warn!(target: "jexec::jit", method = %method.full_name(), %error, "compilation failed");
                method.run_target.store(interpreted);
                None
            }
        }
    }

    fn body_invalidated(&self, entry: usize) -> bool {
        self.vm
            .jit
            .code_cache
            .body(entry)
            .is_none_or(|body| body.is_invalidated())
    }

    /// Whether a method the body at `entry` devirtualized now has an
    /// overrider.
    fn assumptions_broken(&self, entry: usize) -> bool {
        let Some(body) = self.vm.jit.code_cache.body(entry) else {
            return true;
        };
        body.code
            .assumptions
            .iter()
            .any(|&id| self.vm.has_overrider(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{JitMode, RuntimeConfig};
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC, ACC_SYNCHRONIZED};
    use crate::vm::run_target::{RunState, SendTarget};
    use crate::vm::value::JValue;
    use crate::vm::vm::JavaVM;

    fn vm(threshold: u32) -> Arc<JavaVM> {
        let mut config = RuntimeConfig::for_testing();
        config.jit_mode = JitMode::On;
        config.jit_threshold = threshold;
        JavaVM::new(config).unwrap()
    }

    fn define_math(vm: &JavaVM) {
        let class = ClassBuilder::new("demo/Math")
            .method(
                "square",
                "(I)I",
                ACC_PUBLIC | ACC_STATIC,
                "iload_0\n iload_0\n imul\n ireturn",
            )
            .unwrap()
            .method(
                "sumSquares",
                "(I)I",
                ACC_PUBLIC | ACC_STATIC,
                "
                iconst_0
                istore_1
            loop:
                iload_0
                ifle done
                iload_1
                iload_0
                invokestatic demo/Math.square(I)I
                iadd
                istore_1
                iinc 0 -1
                goto loop
            done:
                iload_1
                ireturn
                ",
            )
            .unwrap()
            .method(
                "locked",
                "()I",
                ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED,
                "iconst_3\n ireturn",
            )
            .unwrap()
            .build();
        vm.define_class(class).unwrap();
    }

    #[test]
    fn test_hot_method_runs_compiled() {
        let vm = vm(2);
        define_math(&vm);
        let mut thread = vm.attach_thread("main");
        for n in 0..6 {
            let result = thread
                .call_static("demo/Math", "square", "(I)I", &[JValue::Int(n)])
                .unwrap();
            assert_eq!(result, JValue::Int(n * n));
        }
        let square = vm.find_method("demo/Math", "square", "(I)I").unwrap();
        assert!(matches!(square.run_target.load(), RunState::Compiled(_)));
        let stats = vm.jit.counters.snapshot();
        assert_eq!(stats.compiles, 1);
        assert!(stats.i2j >= 3);
    }

    #[test]
    fn test_compiled_caller_redirects_to_new_callee_body() {
        let vm = vm(3);
        define_math(&vm);
        let mut thread = vm.attach_thread("main");
        for _ in 0..4 {
            let result = thread
                .call_static("demo/Math", "sumSquares", "(I)I", &[JValue::Int(4)])
                .unwrap();
            assert_eq!(result, JValue::Int(30));
        }
        let stats = vm.jit.counters.snapshot();
        assert_eq!(stats.compiles, 2);
        assert!(stats.j2j > 0 || stats.j2i_redirects > 0);
        assert_eq!(stats.compile_failures, 0);
    }

    #[test]
    fn test_synchronized_method_stays_interpreted() {
        let vm = vm(0);
        define_math(&vm);
        let mut thread = vm.attach_thread("main");
        for _ in 0..3 {
            assert_eq!(
                thread.call_static("demo/Math", "locked", "()I", &[]).unwrap(),
                JValue::Int(3)
            );
        }
        let locked = vm.find_method("demo/Math", "locked", "()I").unwrap();
        assert_eq!(locked.run_target.load(), RunState::Send(SendTarget::Interpreted));
        assert_eq!(vm.jit.counters.snapshot().compiles, 0);
    }
}
