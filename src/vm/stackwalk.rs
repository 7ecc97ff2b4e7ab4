//! Walking the Java stack for stack traces.
//!
//! Every frame ends in the same `[literals, pc, a0]` tail, so the walk
//! only needs the current registers: an interpreted frame is found through
//! its method's frame size, a special frame through the frame base held in
//! `a0`. Frames tagged invisible are skipped.

use std::sync::Arc;

use super::debug::StackTraceElement;
use super::frame::{
    A0_INVISIBLE_TAG, A0_REPORT_FRAME_POP_TAG, FrameType, PC_BIAS, compiled_frame_method,
    compiled_frame_pc, frame_tags, method_frame_bp, saved_registers, set_frame_tags,
    special_frame_start,
};
use super::method::{Method, MethodId};
use super::vm_thread::VmThread;

impl VmThread {
    /// Method of the current interpreter frame.
    pub(crate) fn current_method(&self) -> Option<Arc<Method>> {
        self.ctx.literals.and_then(|id| self.vm.method(id))
    }

    /// Stack trace of the current position, innermost frame first.
    pub(crate) fn capture_stack_trace(&self) -> Vec<StackTraceElement> {
        let mut elements = Vec::new();
        let (mut literals, mut pc, mut a0) = (self.ctx.literals, self.ctx.pc, self.ctx.a0);
        loop {
            if pc >= PC_BIAS {
                let Some(method) = literals.and_then(|id| self.vm.method(id)) else {
                    break;
                };
                let bp = method_frame_bp(&method, a0);
                if frame_tags(&self.ctx, bp) & A0_INVISIBLE_TAG == 0 {
                    elements.push(element(&method, Some(pc - PC_BIAS), false));
                }
                (literals, pc, a0) = saved_registers(&self.ctx, bp);
                continue;
            }

            let bp = a0;
            let kind = match FrameType::from_pc(pc) {
                None | Some(FrameType::EndOfStack) => break,
                Some(kind) => kind,
            };
            let visible = frame_tags(&self.ctx, bp) & A0_INVISIBLE_TAG == 0;
            match kind {
                FrameType::Method | FrameType::NativeMethod | FrameType::JniNativeMethod if visible => {
                    let word = self.ctx.stack.read(special_frame_start(kind, bp));
                    if let Some(method) = MethodId::from_word(word).and_then(|id| self.vm.method(id)) {
                        elements.push(element(&method, None, false));
                    }
                }
                FrameType::Compiled if visible => {
                    if let Some(method) = compiled_frame_method(&self.ctx, bp).and_then(|id| self.vm.method(id)) {
                        let pc = compiled_frame_pc(&self.ctx, bp);
                        elements.push(element(&method, Some(pc), true));
                    }
                }
                _ => {}
            }
            (literals, pc, a0) = saved_registers(&self.ctx, bp);
        }
        elements
    }
}

impl VmThread {
    /// Tag the visible interpreted frame `depth` frames down (0 is the
    /// innermost) so its pop is recorded. False if there is no such frame.
    pub(crate) fn request_frame_pop_report(&mut self, depth: usize) -> bool {
        let mut remaining = depth;
        let (mut literals, mut pc, mut a0) = (self.ctx.literals, self.ctx.pc, self.ctx.a0);
        loop {
            let bp = if pc >= PC_BIAS {
                let Some(method) = literals.and_then(|id| self.vm.method(id)) else {
                    return false;
                };
                let bp = method_frame_bp(&method, a0);
                let tags = frame_tags(&self.ctx, bp);
                if tags & A0_INVISIBLE_TAG == 0 {
                    if remaining == 0 {
                        set_frame_tags(&mut self.ctx, bp, tags | A0_REPORT_FRAME_POP_TAG);
                        return true;
                    }
                    remaining -= 1;
                }
                bp
            } else {
                match FrameType::from_pc(pc) {
                    None | Some(FrameType::EndOfStack) => return false,
                    Some(_) => a0,
                }
            };
            (literals, pc, a0) = saved_registers(&self.ctx, bp);
        }
    }
}

fn element(method: &Method, pc: Option<usize>, compiled: bool) -> StackTraceElement {
    StackTraceElement {
        class_name: method.class_name.clone(),
        method_name: method.name.clone(),
        pc,
        line: pc.and_then(|pc| method.lines.find_line(pc)),
        compiled,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::RuntimeConfig;
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::vm::vm::JavaVM;

    #[test]
    fn test_trace_names_interpreted_frames_innermost_first() {
        let mut config = RuntimeConfig::for_testing();
        config.jit_mode = crate::config::JitMode::Off;
        let vm = JavaVM::new(config).unwrap();
        let class = ClassBuilder::new("demo/Trace")
            .method(
                "outer",
                "()V",
                ACC_PUBLIC | ACC_STATIC,
                ".line 3\n invokestatic demo/Trace.inner()V\n return",
            )
            .unwrap()
            .method(
                "inner",
                "()V",
                ACC_PUBLIC | ACC_STATIC,
                ".line 7\n aconst_null\n athrow",
            )
            .unwrap()
            .build();
        vm.define_class(class).unwrap();
        let mut thread = vm.attach_thread("main");
        let error = thread.call_static("demo/Trace", "outer", "()V", &[]).unwrap_err();
        let thrown = error.exception().unwrap();
        assert_eq!(thrown.class_name, "java/lang/NullPointerException");
        assert_eq!(
            thrown.stack_trace,
            vec!["demo.Trace.inner(line 7)".to_string(), "demo.Trace.outer(line 3)".to_string()]
        );
        assert!(thread.stack_trace().is_empty());
    }
}
