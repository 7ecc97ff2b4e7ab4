//! Template compiler: one op sequence per bytecode, no optimization.
//!
//! Covers int/long arithmetic, locals, constants, branches, static calls
//! into initialized classes, instance calls that class-hierarchy analysis
//! shows to be monomorphic, and returns. Anything else makes the whole
//! method stay interpreted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::code::{CompiledCode, Cond, Op};
use super::{JitCompiler, JitError, JitResult};
use crate::vm::bytecode::*;
use crate::vm::class::Class;
use crate::vm::classfile::ACC_FINAL;
use crate::vm::constant_pool::{CpEntry, MemberRef};
use crate::vm::method::{Method, MethodId};
use crate::vm::registry::METHOD_HANDLE_CLASS;
use crate::vm::value::ReturnType;
use crate::vm::vm::JavaVM;

#[derive(Debug, Default)]
pub struct TemplateCompiler;

impl TemplateCompiler {
    pub fn new() -> Self {
        TemplateCompiler
    }
}

impl JitCompiler for TemplateCompiler {
    fn name(&self) -> &str {
        "template"
    }

    fn compile(&self, vm: &JavaVM, method: &Arc<Method>) -> JitResult<CompiledCode> {
        if method.is_native() || method.is_abstract() {
            return Err(JitError::UnsupportedMethod("no bytecode".to_string()));
        }
        if method.is_synchronized() {
            return Err(JitError::UnsupportedMethod("synchronized".to_string()));
        }
        if !method.exception_table.is_empty() {
            return Err(JitError::HasExceptionHandlers);
        }
        let class = vm
            .class(method.class_id)
            .ok_or_else(|| JitError::UnsupportedMethod("class not loaded".to_string()))?;
        let mut emitter = Emitter {
            vm,
            class: &class,
            code: &method.code,
            ops: Vec::new(),
            pcs: Vec::new(),
            branches: Vec::new(),
            starts: HashMap::new(),
            assumptions: Vec::new(),
        };
        emitter.translate()?;
        let code = emitter.finish()?;
        trace!(
            target: "jexec::jit",
            method = %method.full_name(),
            ops = code.len(),
            "template compiled"
        );
        Ok(code)
    }
}

struct Emitter<'a> {
    vm: &'a JavaVM,
    class: &'a Arc<Class>,
    code: &'a [u8],
    ops: Vec<Op>,
    pcs: Vec<usize>,
    /// `(op index, bytecode target)` for each branch op.
    branches: Vec<(usize, usize)>,
    /// Bytecode offset to its first op.
    starts: HashMap<usize, usize>,
    assumptions: Vec<MethodId>,
}

fn invalid(pc: usize) -> JitError {
    JitError::InvalidBytecode { pc }
}

fn if_cond(op: u8) -> Cond {
    match op {
        IFEQ | IF_ICMPEQ => Cond::Eq,
        IFNE | IF_ICMPNE => Cond::Ne,
        IFLT | IF_ICMPLT => Cond::Lt,
        IFGE | IF_ICMPGE => Cond::Ge,
        IFGT | IF_ICMPGT => Cond::Gt,
        _ => Cond::Le,
    }
}

impl Emitter<'_> {
    fn emit(&mut self, pc: usize, op: Op) {
        self.ops.push(op);
        self.pcs.push(pc);
    }

    fn u8_at(&self, at: usize) -> JitResult<u8> {
        self.code.get(at).copied().ok_or_else(|| invalid(at))
    }

    fn u16_at(&self, at: usize) -> JitResult<u16> {
        read_u16(self.code, at).ok_or_else(|| invalid(at))
    }

    /// Emit a branch to `pc + offset`, polling async events first when it
    /// goes backwards.
    fn branch(&mut self, pc: usize, offset: i64, make: impl FnOnce(usize) -> Op) -> JitResult<()> {
        let target = pc as i64 + offset;
        if target < 0 || target as usize >= self.code.len() {
            return Err(invalid(pc));
        }
        let target = target as usize;
        if target <= pc {
            self.emit(pc, Op::AsyncCheck);
        }
        self.branches.push((self.ops.len(), target));
        self.emit(pc, make(0));
        Ok(())
    }

    fn translate(&mut self) -> JitResult<()> {
        let mut pc = 0;
        while pc < self.code.len() {
            let op = self.code[pc];
            let len = instruction_length(self.code, pc).ok_or_else(|| invalid(pc))?;
            self.starts.insert(pc, self.ops.len());
            match op {
                NOP => {}
                ACONST_NULL => self.emit(pc, Op::IConst(0)),
                ICONST_M1..=ICONST_5 => self.emit(pc, Op::IConst(op as i32 - ICONST_0 as i32)),
                LCONST_0 | LCONST_1 => self.emit(pc, Op::LConst((op - LCONST_0) as i64)),
                BIPUSH => self.emit(pc, Op::IConst(self.u8_at(pc + 1)? as i8 as i32)),
                SIPUSH => self.emit(pc, Op::IConst(self.u16_at(pc + 1)? as i16 as i32)),
                LDC | LDC_W | LDC2_W => {
                    let index = if op == LDC {
                        self.u8_at(pc + 1)? as u16
                    } else {
                        self.u16_at(pc + 1)?
                    };
                    let class = self.class;
                    match class.constant_pool.get(index) {
                        Some(CpEntry::Int(v)) => self.emit(pc, Op::IConst(*v)),
                        Some(CpEntry::Long(v)) => self.emit(pc, Op::LConst(*v)),
                        _ => return Err(JitError::UnsupportedBytecode { opcode: op, pc }),
                    }
                }
                ILOAD | ALOAD => self.emit(pc, Op::Load(self.u8_at(pc + 1)? as usize)),
                LLOAD => self.emit(pc, Op::LoadWide(self.u8_at(pc + 1)? as usize)),
                ILOAD_0..=ILOAD_3 => self.emit(pc, Op::Load((op - ILOAD_0) as usize)),
                ALOAD_0..=ALOAD_3 => self.emit(pc, Op::Load((op - ALOAD_0) as usize)),
                LLOAD_0..=LLOAD_3 => self.emit(pc, Op::LoadWide((op - LLOAD_0) as usize)),
                ISTORE | ASTORE => self.emit(pc, Op::Store(self.u8_at(pc + 1)? as usize)),
                LSTORE => self.emit(pc, Op::StoreWide(self.u8_at(pc + 1)? as usize)),
                ISTORE_0..=ISTORE_3 => self.emit(pc, Op::Store((op - ISTORE_0) as usize)),
                ASTORE_0..=ASTORE_3 => self.emit(pc, Op::Store((op - ASTORE_0) as usize)),
                LSTORE_0..=LSTORE_3 => self.emit(pc, Op::StoreWide((op - LSTORE_0) as usize)),
                IINC => {
                    let index = self.u8_at(pc + 1)? as usize;
                    let delta = self.u8_at(pc + 2)? as i8 as i32;
                    self.emit(pc, Op::IInc(index, delta));
                }
                IADD => self.emit(pc, Op::IAdd),
                ISUB => self.emit(pc, Op::ISub),
                IMUL => self.emit(pc, Op::IMul),
                IDIV => self.emit(pc, Op::IDiv),
                IREM => self.emit(pc, Op::IRem),
                INEG => self.emit(pc, Op::INeg),
                IAND => self.emit(pc, Op::IAnd),
                IOR => self.emit(pc, Op::IOr),
                IXOR => self.emit(pc, Op::IXor),
                ISHL => self.emit(pc, Op::IShl),
                ISHR => self.emit(pc, Op::IShr),
                IUSHR => self.emit(pc, Op::IUShr),
                LADD => self.emit(pc, Op::LAdd),
                LSUB => self.emit(pc, Op::LSub),
                LMUL => self.emit(pc, Op::LMul),
                LDIV => self.emit(pc, Op::LDiv),
                LREM => self.emit(pc, Op::LRem),
                LNEG => self.emit(pc, Op::LNeg),
                LAND => self.emit(pc, Op::LAnd),
                LOR => self.emit(pc, Op::LOr),
                LXOR => self.emit(pc, Op::LXor),
                LCMP => self.emit(pc, Op::LCmp),
                I2L => self.emit(pc, Op::I2L),
                L2I => self.emit(pc, Op::L2I),
                POP => self.emit(pc, Op::Pop),
                POP2 => self.emit(pc, Op::Pop2),
                DUP => self.emit(pc, Op::Dup),
                GOTO => {
                    let offset = read_i16(self.code, pc + 1).ok_or_else(|| invalid(pc))?;
                    self.branch(pc, offset as i64, Op::Goto)?;
                }
                GOTO_W => {
                    let offset = read_i32(self.code, pc + 1).ok_or_else(|| invalid(pc))?;
                    self.branch(pc, offset as i64, Op::Goto)?;
                }
                IFEQ..=IFLE => {
                    let offset = read_i16(self.code, pc + 1).ok_or_else(|| invalid(pc))?;
                    let cond = if_cond(op);
                    self.branch(pc, offset as i64, |t| Op::IfZero(cond, t))?;
                }
                IF_ICMPEQ..=IF_ICMPLE => {
                    let offset = read_i16(self.code, pc + 1).ok_or_else(|| invalid(pc))?;
                    let cond = if_cond(op);
                    self.branch(pc, offset as i64, |t| Op::IfICmp(cond, t))?;
                }
                IFNULL | IFNONNULL => {
                    let offset = read_i16(self.code, pc + 1).ok_or_else(|| invalid(pc))?;
                    let when_null = op == IFNULL;
                    self.branch(pc, offset as i64, |t| Op::IfNull(when_null, t))?;
                }
                INVOKESTATIC => {
                    let callee = self.static_target(pc, op)?;
                    self.emit(
                        pc,
                        Op::Invoke {
                            method: callee,
                            null_check: false,
                        },
                    );
                }
                INVOKEVIRTUAL => {
                    let callee = self.virtual_target(pc, op)?;
                    self.emit(
                        pc,
                        Op::Invoke {
                            method: callee,
                            null_check: true,
                        },
                    );
                }
                IRETURN => self.emit(pc, Op::Return(ReturnType::Int)),
                LRETURN => self.emit(pc, Op::Return(ReturnType::Long)),
                ARETURN => self.emit(pc, Op::Return(ReturnType::Object)),
                RETURN => self.emit(pc, Op::Return(ReturnType::Void)),
                _ => return Err(JitError::UnsupportedBytecode { opcode: op, pc }),
            }
            pc += len;
        }
        Ok(())
    }

    fn member(&self, pc: usize, op: u8) -> JitResult<&MemberRef> {
        match self.class.constant_pool.get(self.u16_at(pc + 1)?) {
            Some(CpEntry::Method {
                member,
                is_interface: false,
                ..
            }) => Ok(member),
            _ => Err(JitError::UnsupportedBytecode { opcode: op, pc }),
        }
    }

    fn static_target(&self, pc: usize, op: u8) -> JitResult<Arc<Method>> {
        let member = self.member(pc, op)?;
        let owner = self
            .vm
            .class_by_name(&member.class)
            .filter(|c| c.is_initialized())
            .ok_or_else(|| JitError::UnsupportedMethod(format!("{} not initialized", member.class)))?;
        owner
            .lookup_method(&member.name, &member.descriptor)
            .filter(|m| m.is_static() && !m.is_abstract())
            .ok_or_else(|| JitError::UnsupportedBytecode { opcode: op, pc })
    }

    /// The single implementation an `invokevirtual` can reach, recording
    /// the assumption when that depends on the current class hierarchy.
    fn virtual_target(&mut self, pc: usize, op: u8) -> JitResult<Arc<Method>> {
        let member = self.member(pc, op)?.clone();
        if member.class == METHOD_HANDLE_CLASS {
            return Err(JitError::UnsupportedBytecode { opcode: op, pc });
        }
        let owner = self
            .vm
            .class_by_name(&member.class)
            .filter(|c| !c.is_interface())
            .ok_or_else(|| JitError::UnsupportedMethod(format!("{} not loaded", member.class)))?;
        let target = owner
            .lookup_method(&member.name, &member.descriptor)
            .filter(|m| !m.is_static() && !m.is_abstract())
            .ok_or_else(|| JitError::UnsupportedBytecode { opcode: op, pc })?;
        if target.is_private() || target.flags & ACC_FINAL != 0 || owner.flags & ACC_FINAL != 0 {
            return Ok(target);
        }
        let index = owner
            .vtable_index(&member.name, &member.descriptor)
            .ok_or_else(|| JitError::UnsupportedBytecode { opcode: op, pc })?;
        let overridden = self.vm.classes().iter().any(|c| {
            c.is_subtype_of(&owner) && c.vtable.get(index).is_some_and(|m| m.id != target.id)
        });
        if overridden {
            return Err(JitError::UnsupportedMethod(format!(
                "polymorphic call to {}",
                target.full_name()
            )));
        }
        if !self.assumptions.contains(&target.id) {
            self.assumptions.push(target.id);
        }
        Ok(target)
    }

    fn finish(mut self) -> JitResult<CompiledCode> {
        for (at, target) in std::mem::take(&mut self.branches) {
            let index = *self.starts.get(&target).ok_or_else(|| invalid(target))?;
            match &mut self.ops[at] {
                Op::Goto(t) | Op::IfZero(_, t) | Op::IfICmp(_, t) | Op::IfNull(_, t) => *t = index,
                _ => return Err(invalid(self.pcs[at])),
            }
        }
        if !matches!(self.ops.last(), Some(Op::Return(_) | Op::Goto(_))) {
            return Err(invalid(self.code.len()));
        }
        Ok(CompiledCode {
            ops: self.ops,
            pcs: self.pcs,
            assumptions: self.assumptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC};

    fn compile(vm: &JavaVM, class: &str, name: &str, desc: &str) -> JitResult<CompiledCode> {
        let method = vm.find_method(class, name, desc).unwrap();
        TemplateCompiler::new().compile(vm, &method)
    }

    #[test]
    fn test_backward_branch_gets_async_check() {
        let vm = JavaVM::new(RuntimeConfig::for_testing()).unwrap();
        vm.define_class(
            ClassBuilder::new("demo/Loop")
                .method(
                    "count",
                    "(I)I",
                    ACC_PUBLIC | ACC_STATIC,
                    "
                        iconst_0
                        istore_1
                    top:
                        iload_0
                        ifle done
                        iinc 1 1
                        iinc 0 -1
                        goto top
                    done:
                        iload_1
                        ireturn
                    ",
                )
                .unwrap()
                .build(),
        )
        .unwrap();
        let code = compile(&vm, "demo/Loop", "count", "(I)I").unwrap();
        let goto = code.ops.iter().position(|op| matches!(op, Op::Goto(_))).unwrap();
        assert!(matches!(code.ops[goto - 1], Op::AsyncCheck));
        let Op::Goto(target) = code.ops[goto] else {
            unreachable!()
        };
        assert!(matches!(code.ops[target], Op::Load(0)));
        assert_eq!(code.pcs[goto - 1], code.pcs[goto]);
    }

    #[test]
    fn test_rejects_handlers_and_floats() {
        let vm = JavaVM::new(RuntimeConfig::for_testing()).unwrap();
        vm.define_class(
            ClassBuilder::new("demo/Bad")
                .method(
                    "guarded",
                    "()I",
                    ACC_PUBLIC | ACC_STATIC,
                    "
                    start:
                        iconst_1
                        ireturn
                    end:
                    handler:
                        pop
                        iconst_0
                        ireturn
                    .catch any from start to end using handler
                    ",
                )
                .unwrap()
                .method("float", "()F", ACC_PUBLIC | ACC_STATIC, "fconst_1\nfreturn")
                .unwrap()
                .build(),
        )
        .unwrap();
        assert_eq!(
            compile(&vm, "demo/Bad", "guarded", "()I").unwrap_err(),
            JitError::HasExceptionHandlers
        );
        assert!(matches!(
            compile(&vm, "demo/Bad", "float", "()F").unwrap_err(),
            JitError::UnsupportedBytecode { opcode: FCONST_1, pc: 0 }
        ));
    }

    #[test]
    fn test_monomorphic_call_records_assumption() {
        let vm = JavaVM::new(RuntimeConfig::for_testing()).unwrap();
        vm.define_class(
            ClassBuilder::new("demo/Shape")
                .method("<init>", "()V", ACC_PUBLIC, "aload_0\ninvokespecial java/lang/Object.<init>()V\nreturn")
                .unwrap()
                .method("sides", "()I", ACC_PUBLIC, "iconst_0\nireturn")
                .unwrap()
                .method(
                    "twice",
                    "(Ldemo/Shape;)I",
                    ACC_PUBLIC | ACC_STATIC,
                    "
                        aload_0
                        invokevirtual demo/Shape.sides()I
                        iconst_2
                        imul
                        ireturn
                    ",
                )
                .unwrap()
                .build(),
        )
        .unwrap();
        let sides = vm.find_method("demo/Shape", "sides", "()I").unwrap();
        let code = compile(&vm, "demo/Shape", "twice", "(Ldemo/Shape;)I").unwrap();
        assert_eq!(code.assumptions, vec![sides.id]);

        vm.define_class(
            ClassBuilder::new("demo/Square")
                .super_class("demo/Shape")
                .method("sides", "()I", ACC_PUBLIC, "iconst_4\nireturn")
                .unwrap()
                .build(),
        )
        .unwrap();
        assert!(matches!(
            compile(&vm, "demo/Shape", "twice", "(Ldemo/Shape;)I").unwrap_err(),
            JitError::UnsupportedMethod(_)
        ));
    }
}
