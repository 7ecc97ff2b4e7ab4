//! Arithmetic, conversions and comparisons.
//!
//! Integer arithmetic wraps. Division by zero throws; `MIN / -1` yields
//! `MIN` and `MIN % -1` yields zero instead of trapping. Float to integer
//! conversions saturate and map NaN to zero, which is what `as` does.

use super::{Step, misrouted};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::*;
use crate::vm::context::ExecutionContext;

pub(crate) fn int_div(a: i32, b: i32) -> Option<i32> {
    match b {
        0 => None,
        -1 => Some(a.wrapping_neg()),
        _ => Some(a / b),
    }
}

pub(crate) fn int_rem(a: i32, b: i32) -> Option<i32> {
    match b {
        0 => None,
        -1 => Some(0),
        _ => Some(a % b),
    }
}

pub(crate) fn long_div(a: i64, b: i64) -> Option<i64> {
    match b {
        0 => None,
        -1 => Some(a.wrapping_neg()),
        _ => Some(a / b),
    }
}

pub(crate) fn long_rem(a: i64, b: i64) -> Option<i64> {
    match b {
        0 => None,
        -1 => Some(0),
        _ => Some(a % b),
    }
}

/// `fcmpl`/`dcmpl` (`nan_result == -1`) and `fcmpg`/`dcmpg` (`1`).
fn float_compare(a: f64, b: f64, nan_result: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(ordering) => ordering as i32,
        None => nan_result,
    }
}

macro_rules! binary {
    ($ctx:expr, $pop:ident, $push:ident, |$a:ident, $b:ident| $body:expr) => {{
        let $b = $ctx.$pop();
        let $a = $ctx.$pop();
        $ctx.$push($body);
    }};
}

pub(super) fn execute(ctx: &mut ExecutionContext, op: u8) -> Step {
    match op {
        IADD => binary!(ctx, pop_int, push_int, |a, b| a.wrapping_add(b)),
        LADD => binary!(ctx, pop_long, push_long, |a, b| a.wrapping_add(b)),
        FADD => binary!(ctx, pop_float, push_float, |a, b| a + b),
        DADD => binary!(ctx, pop_double, push_double, |a, b| a + b),
        ISUB => binary!(ctx, pop_int, push_int, |a, b| a.wrapping_sub(b)),
        LSUB => binary!(ctx, pop_long, push_long, |a, b| a.wrapping_sub(b)),
        FSUB => binary!(ctx, pop_float, push_float, |a, b| a - b),
        DSUB => binary!(ctx, pop_double, push_double, |a, b| a - b),
        IMUL => binary!(ctx, pop_int, push_int, |a, b| a.wrapping_mul(b)),
        LMUL => binary!(ctx, pop_long, push_long, |a, b| a.wrapping_mul(b)),
        FMUL => binary!(ctx, pop_float, push_float, |a, b| a * b),
        DMUL => binary!(ctx, pop_double, push_double, |a, b| a * b),
        IDIV => {
            let b = ctx.pop_int();
            let a = ctx.pop_int();
            ctx.push_int(int_div(a, b).ok_or(BytecodeAction::ThrowArithmetic)?);
        }
        LDIV => {
            let b = ctx.pop_long();
            let a = ctx.pop_long();
            ctx.push_long(long_div(a, b).ok_or(BytecodeAction::ThrowArithmetic)?);
        }
        FDIV => binary!(ctx, pop_float, push_float, |a, b| a / b),
        DDIV => binary!(ctx, pop_double, push_double, |a, b| a / b),
        IREM => {
            let b = ctx.pop_int();
            let a = ctx.pop_int();
            ctx.push_int(int_rem(a, b).ok_or(BytecodeAction::ThrowArithmetic)?);
        }
        LREM => {
            let b = ctx.pop_long();
            let a = ctx.pop_long();
            ctx.push_long(long_rem(a, b).ok_or(BytecodeAction::ThrowArithmetic)?);
        }
        FREM => binary!(ctx, pop_float, push_float, |a, b| a % b),
        DREM => binary!(ctx, pop_double, push_double, |a, b| a % b),
        INEG => {
            let v = ctx.pop_int();
            ctx.push_int(v.wrapping_neg());
        }
        LNEG => {
            let v = ctx.pop_long();
            ctx.push_long(v.wrapping_neg());
        }
        FNEG => {
            let v = ctx.pop_float();
            ctx.push_float(-v);
        }
        DNEG => {
            let v = ctx.pop_double();
            ctx.push_double(-v);
        }

        // Shift distances are masked to the operand width.
        ISHL => binary!(ctx, pop_int, push_int, |a, b| a.wrapping_shl(b as u32)),
        ISHR => binary!(ctx, pop_int, push_int, |a, b| a.wrapping_shr(b as u32)),
        IUSHR => binary!(ctx, pop_int, push_int, |a, b| (a as u32).wrapping_shr(b as u32) as i32),
        LSHL => {
            let b = ctx.pop_int();
            let a = ctx.pop_long();
            ctx.push_long(a.wrapping_shl(b as u32));
        }
        LSHR => {
            let b = ctx.pop_int();
            let a = ctx.pop_long();
            ctx.push_long(a.wrapping_shr(b as u32));
        }
        LUSHR => {
            let b = ctx.pop_int();
            let a = ctx.pop_long();
            ctx.push_long((a as u64).wrapping_shr(b as u32) as i64);
        }
        IAND => binary!(ctx, pop_int, push_int, |a, b| a & b),
        LAND => binary!(ctx, pop_long, push_long, |a, b| a & b),
        IOR => binary!(ctx, pop_int, push_int, |a, b| a | b),
        LOR => binary!(ctx, pop_long, push_long, |a, b| a | b),
        IXOR => binary!(ctx, pop_int, push_int, |a, b| a ^ b),
        LXOR => binary!(ctx, pop_long, push_long, |a, b| a ^ b),

        I2L => {
            let v = ctx.pop_int();
            ctx.push_long(v as i64);
        }
        I2F => {
            let v = ctx.pop_int();
            ctx.push_float(v as f32);
        }
        I2D => {
            let v = ctx.pop_int();
            ctx.push_double(v as f64);
        }
        L2I => {
            let v = ctx.pop_long();
            ctx.push_int(v as i32);
        }
        L2F => {
            let v = ctx.pop_long();
            ctx.push_float(v as f32);
        }
        L2D => {
            let v = ctx.pop_long();
            ctx.push_double(v as f64);
        }
        F2I => {
            let v = ctx.pop_float();
            ctx.push_int(v as i32);
        }
        F2L => {
            let v = ctx.pop_float();
            ctx.push_long(v as i64);
        }
        F2D => {
            let v = ctx.pop_float();
            ctx.push_double(v as f64);
        }
        D2I => {
            let v = ctx.pop_double();
            ctx.push_int(v as i32);
        }
        D2L => {
            let v = ctx.pop_double();
            ctx.push_long(v as i64);
        }
        D2F => {
            let v = ctx.pop_double();
            ctx.push_float(v as f32);
        }
        I2B => {
            let v = ctx.pop_int();
            ctx.push_int(v as i8 as i32);
        }
        I2C => {
            let v = ctx.pop_int();
            ctx.push_int(v as u16 as i32);
        }
        I2S => {
            let v = ctx.pop_int();
            ctx.push_int(v as i16 as i32);
        }

        LCMP => {
            let b = ctx.pop_long();
            let a = ctx.pop_long();
            ctx.push_int(a.cmp(&b) as i32);
        }
        FCMPL | FCMPG => {
            let b = ctx.pop_float();
            let a = ctx.pop_float();
            let nan = if op == FCMPL { -1 } else { 1 };
            ctx.push_int(float_compare(a as f64, b as f64, nan));
        }
        DCMPL | DCMPG => {
            let b = ctx.pop_double();
            let a = ctx.pop_double();
            let nan = if op == DCMPL { -1 } else { 1 };
            ctx.push_int(float_compare(a, b, nan));
        }
        _ => return Err(misrouted(op)),
    }
    ctx.advance(1);
    Ok(BytecodeAction::ExecuteBytecode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn run(op: u8, setup: impl FnOnce(&mut ExecutionContext)) -> (ExecutionContext, Step) {
        let mut ctx = ExecutionContext::new(64);
        ctx.set_bytecode_pc(0);
        setup(&mut ctx);
        let step = execute(&mut ctx, op);
        (ctx, step)
    }

    #[rstest]
    #[case(i32::MIN, -1, i32::MIN, 0)]
    #[case(7, -2, -3, 1)]
    #[case(-7, 2, -3, -1)]
    #[case(i32::MAX, 1, i32::MAX, 0)]
    fn test_int_division_edges(#[case] a: i32, #[case] b: i32, #[case] quot: i32, #[case] rem: i32) {
        assert_eq!(int_div(a, b), Some(quot));
        assert_eq!(int_rem(a, b), Some(rem));
    }

    #[test]
    fn test_division_by_zero_throws() {
        let (ctx, step) = run(IDIV, |ctx| {
            ctx.push_int(1);
            ctx.push_int(0);
        });
        assert_eq!(step, Err(BytecodeAction::ThrowArithmetic));
        assert_eq!(ctx.bytecode_pc(), 0);
        assert_eq!(long_rem(5, 0), None);
        assert_eq!(long_div(i64::MIN, -1), Some(i64::MIN));
    }

    #[rstest]
    #[case(FCMPL, -1)]
    #[case(FCMPG, 1)]
    fn test_nan_comparison_bias(#[case] op: u8, #[case] expected: i32) {
        let (mut ctx, step) = run(op, |ctx| {
            ctx.push_float(f32::NAN);
            ctx.push_float(1.0);
        });
        assert_eq!(step, Ok(BytecodeAction::ExecuteBytecode));
        assert_eq!(ctx.pop_int(), expected);
        assert_eq!(ctx.bytecode_pc(), 1);
    }

    #[test]
    fn test_conversions_saturate() {
        let (mut ctx, _) = run(D2I, |ctx| ctx.push_double(1e20));
        assert_eq!(ctx.pop_int(), i32::MAX);
        let (mut ctx, _) = run(F2L, |ctx| ctx.push_float(f32::NAN));
        assert_eq!(ctx.pop_long(), 0);
        let (mut ctx, _) = run(I2C, |ctx| ctx.push_int(-1));
        assert_eq!(ctx.pop_int(), 0xffff);
    }

    #[test]
    fn test_shift_distance_is_masked() {
        let (mut ctx, _) = run(ISHL, |ctx| {
            ctx.push_int(1);
            ctx.push_int(33);
        });
        assert_eq!(ctx.pop_int(), 2);
        let (mut ctx, _) = run(LUSHR, |ctx| {
            ctx.push_long(-1);
            ctx.push_int(60);
        });
        assert_eq!(ctx.pop_long(), 0xf);
    }

    proptest! {
        #[test]
        fn prop_iadd_wraps_like_i32(a: i32, b: i32) {
            let (mut ctx, _) = run(IADD, |ctx| {
                ctx.push_int(a);
                ctx.push_int(b);
            });
            prop_assert_eq!(ctx.pop_int(), a.wrapping_add(b));
        }

        #[test]
        fn prop_division_identity(a: i32, b in any::<i32>().prop_filter("non-zero", |b| *b != 0)) {
            let q = int_div(a, b).unwrap();
            let r = int_rem(a, b).unwrap();
            prop_assert_eq!(q.wrapping_mul(b).wrapping_add(r), a);
        }

        #[test]
        fn prop_lcmp_matches_ordering(a: i64, b: i64) {
            let (mut ctx, _) = run(LCMP, |ctx| {
                ctx.push_long(a);
                ctx.push_long(b);
            });
            prop_assert_eq!(ctx.pop_int(), a.cmp(&b) as i32);
        }
    }
}
