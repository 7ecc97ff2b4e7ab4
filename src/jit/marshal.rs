//! Argument and return-value marshalling across the i2j/j2i boundary.
//!
//! Arguments arrive on the interpreter's operand stack. The compiled
//! calling convention wants the first few of each register class in
//! registers; the rest stay in their stack slots. Compiled bodies home
//! register arguments back into their local slots on entry, so a
//! materialized interpreter frame always finds them there.

use crate::vm::context::ExecutionContext;
use crate::vm::method::Method;
use crate::vm::value::{JavaType, ReturnType, Word};

use super::registers::{ARGUMENT_FPRS, ARGUMENT_GPRS, JitRegisterFile, RETURN_FPR, RETURN_GPR};

/// Where one argument lives under the compiled convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Gpr(usize),
    Fpr(usize),
    /// Local slot index; passed in memory.
    Stack(usize),
}

/// Assign each argument (receiver first) a location, with its local slot.
pub fn argument_locations(method: &Method) -> Vec<(usize, ArgLocation)> {
    let mut locations = Vec::new();
    let mut next_gpr = 0;
    let mut next_fpr = 0;
    let mut slot = 0;
    let receiver = (!method.is_static()).then_some(JavaType::Reference);
    for ty in receiver.into_iter().chain(method.signature.args.iter().copied()) {
        let is_float = matches!(ty, JavaType::Float | JavaType::Double);
        let location = if is_float && next_fpr < ARGUMENT_FPRS.len() {
            next_fpr += 1;
            ArgLocation::Fpr(ARGUMENT_FPRS[next_fpr - 1])
        } else if !is_float && next_gpr < ARGUMENT_GPRS.len() {
            next_gpr += 1;
            ArgLocation::Gpr(ARGUMENT_GPRS[next_gpr - 1])
        } else {
            ArgLocation::Stack(slot)
        };
        locations.push((slot, location));
        slot += ty.slots();
    }
    locations
}

/// Address holding local `slot` for arguments whose frame base is `a0`.
/// Two-slot values live in the lower slot.
fn slot_address(method: &Method, a0: usize, slot: usize) -> usize {
    let wide = argument_type(method, slot).is_some_and(JavaType::is_wide);
    if wide { a0 - slot - 1 } else { a0 - slot }
}

fn argument_type(method: &Method, slot: usize) -> Option<JavaType> {
    let mut current = 0;
    if !method.is_static() {
        if slot == 0 {
            return Some(JavaType::Reference);
        }
        current = 1;
    }
    for &ty in &method.signature.args {
        if current == slot {
            return Some(ty);
        }
        current += ty.slots();
    }
    None
}

/// Load register arguments from the operand stack, whose arguments start
/// at `a0`.
pub fn marshal_arguments(ctx: &ExecutionContext, method: &Method, a0: usize, regs: &mut JitRegisterFile) {
    for (slot, location) in argument_locations(method) {
        let word = ctx.stack.read(slot_address(method, a0, slot));
        match location {
            ArgLocation::Gpr(r) => regs.gpr[r] = word,
            ArgLocation::Fpr(r) => regs.fpr[r] = word,
            ArgLocation::Stack(_) => {}
        }
    }
}

/// Store register arguments into their local slots.
pub fn home_arguments(ctx: &mut ExecutionContext, method: &Method, a0: usize, regs: &JitRegisterFile) {
    for (slot, location) in argument_locations(method) {
        let word = match location {
            ArgLocation::Gpr(r) => regs.gpr[r],
            ArgLocation::Fpr(r) => regs.fpr[r],
            ArgLocation::Stack(_) => continue,
        };
        ctx.stack.write(slot_address(method, a0, slot), word);
    }
}

/// Place a return value in the register its category uses.
pub fn set_return_register(regs: &mut JitRegisterFile, ret: ReturnType, value: Word) {
    match ret {
        ReturnType::Void => {}
        ReturnType::Float | ReturnType::Double => regs.fpr[RETURN_FPR] = value,
        _ => regs.gpr[RETURN_GPR] = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::ClassId;
    use crate::vm::classfile::{ACC_STATIC, MethodDef};
    use crate::vm::method::MethodId;

    fn method(descriptor: &str, flags: u16) -> Method {
        let def = MethodDef {
            name: "m".into(),
            descriptor: descriptor.into(),
            flags,
            max_locals: 12,
            max_stack: 2,
            code: vec![0xb1],
            ..MethodDef::default()
        };
        Method::from_def(&def, MethodId(0), ClassId(0), "T", None).unwrap()
    }

    #[test]
    fn test_locations_split_register_classes() {
        let m = method("(IDJF)V", 0);
        let locations = argument_locations(&m);
        assert_eq!(
            locations,
            vec![
                (0, ArgLocation::Gpr(1)),
                (1, ArgLocation::Gpr(2)),
                (2, ArgLocation::Fpr(0)),
                (4, ArgLocation::Gpr(3)),
                (6, ArgLocation::Fpr(1)),
            ]
        );
    }

    #[test]
    fn test_overflow_arguments_stay_on_stack() {
        let m = method("(IIIIIII)V", ACC_STATIC);
        let locations = argument_locations(&m);
        assert_eq!(locations[5], (5, ArgLocation::Gpr(6)));
        assert_eq!(locations[6], (6, ArgLocation::Stack(6)));
    }

    #[test]
    fn test_marshal_then_home_roundtrip() {
        let m = method("(JI)V", ACC_STATIC);
        let mut ctx = ExecutionContext::new(32);
        ctx.push_long(-3);
        ctx.push_int(8);
        let a0 = ctx.sp + m.arg_slots - 1;
        let mut regs = JitRegisterFile::default();
        marshal_arguments(&ctx, &m, a0, &mut regs);
        assert_eq!(regs.gpr[1] as i64, -3);
        assert_eq!(regs.gpr[2] as u32 as i32, 8);

        ctx.poke(0, 0);
        ctx.poke(1, 0);
        home_arguments(&mut ctx, &m, a0, &regs);
        assert_eq!(ctx.pop_int(), 8);
        assert_eq!(ctx.pop_long(), -3);
    }
}
