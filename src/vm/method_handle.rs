//! Method types and direct method handles.
//!
//! `invokeExact` only accepts a call site whose descriptor equals the
//! handle's type. `invoke` also accepts sites whose arguments widen to the
//! handle's parameters and whose return type the handle's result widens to;
//! those calls run through a method-type frame and a nested call-in.

use std::sync::Arc;

use super::action::BytecodeAction;
use super::bytecode::INVOKEVIRTUAL;
use super::exception::ThrowableKind;
use super::frame::{build_method_type_frame, restore_method_type_frame};
use super::heap::ObjectBody;
use super::method::{Method, MethodSignature, parse_method_descriptor};
use super::value::{JValue, JavaType, ObjectRef, Word};
use super::vm_thread::VmThread;

/// Body of a `java/lang/invoke/MethodType` object.
#[derive(Debug, Clone)]
pub struct MethodTypeDesc {
    pub descriptor: String,
    pub signature: MethodSignature,
}

impl MethodTypeDesc {
    pub fn parse(descriptor: &str) -> Option<Self> {
        Some(MethodTypeDesc {
            descriptor: descriptor.to_string(),
            signature: parse_method_descriptor(descriptor)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Static,
    /// Dispatches on the receiver's class.
    Virtual,
    /// Calls the target exactly, receiver included.
    Special,
}

/// Body of a `java/lang/invoke/MethodHandle` object.
#[derive(Debug, Clone)]
pub struct MethodHandleData {
    pub target: Arc<Method>,
    pub kind: HandleKind,
    /// The handle's type: the target's descriptor, with the receiver as a
    /// leading parameter for instance methods.
    pub type_descriptor: String,
}

impl MethodHandleData {
    pub fn new(target: Arc<Method>, kind: HandleKind) -> Self {
        let type_descriptor = if target.is_static() {
            target.descriptor.clone()
        } else {
            let params = target.descriptor.strip_prefix('(').unwrap_or(&target.descriptor);
            format!("(L{};{}", target.class_name, params)
        };
        MethodHandleData {
            target,
            kind,
            type_descriptor,
        }
    }
}

/// Whether a value of type `from` may be passed where `to` is expected
/// under `invoke`'s conversions.
pub fn can_widen(from: JavaType, to: JavaType) -> bool {
    use JavaType::*;
    if from == to {
        return true;
    }
    match from {
        Byte => matches!(to, Short | Int | Long | Float | Double),
        Short | Char => matches!(to, Int | Long | Float | Double),
        Int => matches!(to, Long | Float | Double),
        Long => matches!(to, Float | Double),
        Float => matches!(to, Double),
        _ => false,
    }
}

/// Whether a call site typed `site` can invoke a handle typed `handle`.
pub fn adaptable(site: &MethodSignature, handle: &MethodSignature) -> bool {
    site.args.len() == handle.args.len()
        && site
            .args
            .iter()
            .zip(&handle.args)
            .all(|(&from, &to)| can_widen(from, to))
        && (site.ret == JavaType::Void || can_widen(handle.ret, site.ret))
}

/// Convert `value` to `to`. Only called after [`can_widen`] accepted the
/// pair.
pub fn widen(value: JValue, to: JavaType) -> JValue {
    match (value, to) {
        (JValue::Int(v), JavaType::Long) => JValue::Long(v as i64),
        (JValue::Int(v), JavaType::Float) => JValue::Float(v as f32),
        (JValue::Int(v), JavaType::Double) => JValue::Double(v as f64),
        (JValue::Long(v), JavaType::Float) => JValue::Float(v as f32),
        (JValue::Long(v), JavaType::Double) => JValue::Double(v as f64),
        (JValue::Float(v), JavaType::Double) => JValue::Double(v as f64),
        (value, _) => value,
    }
}

impl VmThread {
    /// `invokevirtual` of `MethodHandle.invoke`/`invokeExact` with call-site
    /// type `site_descriptor`. The handle sits below the arguments.
    pub(crate) fn invoke_method_handle(&mut self, site_descriptor: &str, exact: bool) -> BytecodeAction {
        let Some(site) = parse_method_descriptor(site_descriptor) else {
            return BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!("malformed call site type {}", site_descriptor),
            );
        };
        let site_slots = site.arg_slots();
        let handle_ref = self.ctx.peek_ref(site_slots);
        let Some(handle) = self.vm.heap.get(handle_ref) else {
            return BytecodeAction::ThrowNullPointer;
        };
        let ObjectBody::MethodHandle(data) = &handle.body else {
            return BytecodeAction::ThrowClassCast {
                from: handle.class.name.clone(),
                to: "java/lang/invoke/MethodHandle".to_string(),
            };
        };

        if data.type_descriptor == site_descriptor {
            // Drop the handle: every argument moves up one slot.
            for i in (0..site_slots).rev() {
                let word = self.ctx.peek(i);
                self.ctx.poke(i + 1, word);
            }
            self.ctx.sp += 1;
            let receiver = if data.target.is_static() {
                ObjectRef::NULL
            } else {
                self.ctx.peek_ref(data.target.arg_slots - 1)
            };
            let target = match self.handle_target(data, receiver) {
                Ok(target) => target,
                Err(action) => return action,
            };
            self.send_method = Some(target);
            self.send_precounted = false;
            return BytecodeAction::RunMethod;
        }

        if exact {
            return BytecodeAction::ThrowWrongMethodType {
                expected: data.type_descriptor.clone(),
                actual: site_descriptor.to_string(),
            };
        }
        let Some(handle_sig) = parse_method_descriptor(&data.type_descriptor) else {
            return BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!("malformed handle type {}", data.type_descriptor),
            );
        };
        if !adaptable(&site, &handle_sig) {
            return BytecodeAction::ThrowWrongMethodType {
                expected: data.type_descriptor.clone(),
                actual: site_descriptor.to_string(),
            };
        }
        let data = data.clone();
        self.invoke_adapted(handle_ref, &data, &site, &handle_sig)
    }

    fn invoke_adapted(
        &mut self,
        handle_ref: ObjectRef,
        data: &MethodHandleData,
        site: &MethodSignature,
        handle_sig: &MethodSignature,
    ) -> BytecodeAction {
        let mut args: Vec<JValue> = site
            .args
            .iter()
            .rev()
            .map(|ty| self.ctx.pop_value(ty.return_type()))
            .collect();
        args.reverse();
        self.ctx.pop_ref();

        let description: Vec<Word> = args.iter().map(|a| a.to_slots().0[0]).collect();
        let bp = build_method_type_frame(&mut self.ctx, handle_ref, site.arg_slots(), &description);
        let converted: Vec<JValue> = args
            .iter()
            .zip(&handle_sig.args)
            .map(|(&value, &ty)| widen(value, ty))
            .collect();

        let receiver = if data.target.is_static() {
            ObjectRef::NULL
        } else {
            converted.first().and_then(JValue::as_ref).unwrap_or(ObjectRef::NULL)
        };
        let result = match self.handle_target(data, receiver) {
            Ok(target) => self.call_in(&target, &converted),
            Err(action) => {
                restore_method_type_frame(&mut self.ctx, bp);
                return action;
            }
        };
        restore_method_type_frame(&mut self.ctx, bp);

        match result {
            Ok(value) => {
                if site.ret != JavaType::Void {
                    self.ctx.push_value(widen(value, site.ret));
                }
                self.ctx.advance(invokevirtual_length());
                BytecodeAction::ExecuteBytecode
            }
            Err(exception) => {
                self.exception = exception;
                BytecodeAction::ThrowCurrentException
            }
        }
    }

    /// The method a handle call lands in, initializing the declaring class
    /// of static targets.
    fn handle_target(
        &mut self,
        data: &MethodHandleData,
        receiver: ObjectRef,
    ) -> Result<Arc<Method>, BytecodeAction> {
        match data.kind {
            HandleKind::Static => {
                if let Some(class) = self.vm.class(data.target.class_id) {
                    self.initialize_class(&class)?;
                }
                Ok(Arc::clone(&data.target))
            }
            HandleKind::Special => Ok(Arc::clone(&data.target)),
            HandleKind::Virtual => {
                let object = self
                    .vm
                    .heap
                    .get(receiver)
                    .ok_or(BytecodeAction::ThrowNullPointer)?;
                let target = &data.target;
                Ok(object
                    .class
                    .vtable_index(&target.name, &target.descriptor)
                    .and_then(|i| object.class.vtable.get(i).cloned())
                    .unwrap_or_else(|| Arc::clone(target)))
            }
        }
    }
}

fn invokevirtual_length() -> usize {
    super::bytecode::fixed_length(INVOKEVIRTUAL).unwrap_or(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JavaType::Int, JavaType::Long, true)]
    #[case(JavaType::Int, JavaType::Double, true)]
    #[case(JavaType::Byte, JavaType::Short, true)]
    #[case(JavaType::Char, JavaType::Short, false)]
    #[case(JavaType::Long, JavaType::Int, false)]
    #[case(JavaType::Double, JavaType::Float, false)]
    #[case(JavaType::Boolean, JavaType::Int, false)]
    #[case(JavaType::Reference, JavaType::Reference, true)]
    fn test_widening_table(#[case] from: JavaType, #[case] to: JavaType, #[case] ok: bool) {
        assert_eq!(can_widen(from, to), ok);
    }

    #[test]
    fn test_adaptable_checks_arity_and_return() {
        let handle = parse_method_descriptor("(JD)J").unwrap();
        assert!(adaptable(&parse_method_descriptor("(IF)J").unwrap(), &handle));
        assert!(adaptable(&parse_method_descriptor("(IF)V").unwrap(), &handle));
        assert!(adaptable(&parse_method_descriptor("(JD)D").unwrap(), &handle));
        assert!(!adaptable(&parse_method_descriptor("(JD)I").unwrap(), &handle));
        assert!(!adaptable(&parse_method_descriptor("(J)J").unwrap(), &handle));
    }

    #[test]
    fn test_widen_values() {
        assert_eq!(widen(JValue::Int(-3), JavaType::Long), JValue::Long(-3));
        assert_eq!(widen(JValue::Float(1.5), JavaType::Double), JValue::Double(1.5));
        assert_eq!(widen(JValue::Int(7), JavaType::Int), JValue::Int(7));
    }
}
