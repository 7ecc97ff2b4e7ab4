//! Interpreter behavior through the embedding API: single stepping,
//! exception dispatch and the stack overflow path.

use std::sync::Arc;

use jexec::vm::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC};
use jexec::vm::value::int_to_word;
use jexec::vm::BytecodeAction;
use jexec::{ClassBuilder, GrowthPolicy, JValue, JavaVM, JitMode, RuntimeConfig};
use proptest::prelude::*;
use rstest::rstest;

const PUBLIC_STATIC: u16 = ACC_PUBLIC | ACC_STATIC;

fn interpreter_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::for_testing();
    config.jit_mode = JitMode::Off;
    config
}

fn vm() -> Arc<JavaVM> {
    JavaVM::new(interpreter_config()).unwrap()
}

fn define_calc(vm: &JavaVM) {
    let calc = ClassBuilder::new("demo/Calc")
        .method("add", "(II)I", PUBLIC_STATIC, "iload_0\n iload_1\n iadd\n ireturn")
        .unwrap()
        .method("div", "(II)I", PUBLIC_STATIC, "iload_0\n iload_1\n idiv\n ireturn")
        .unwrap()
        .method("rem", "(II)I", PUBLIC_STATIC, "iload_0\n iload_1\n irem\n ireturn")
        .unwrap()
        .method(
            "safeDiv",
            "(II)I",
            PUBLIC_STATIC,
            "
        start:
            iload_0
            iload_1
            idiv
            ireturn
        end:
        handler:
            pop
            iconst_m1
            ireturn
            .catch java/lang/ArithmeticException from start to end using handler
            ",
        )
        .unwrap()
        .method(
            "element",
            "(II)I",
            PUBLIC_STATIC,
            "iload_0\n newarray int\n iload_1\n iaload\n ireturn",
        )
        .unwrap()
        .build();
    vm.define_class(calc).unwrap();
}

// =============================================================================
// Single stepping
// =============================================================================

#[test]
fn test_stepping_iadd_replaces_operands_and_advances_pc() {
    let vm = vm();
    define_calc(&vm);
    let add = vm.find_method("demo/Calc", "add", "(II)I").unwrap();
    let mut thread = vm.attach_thread("main");
    thread.enter_method(&add, &[JValue::Int(2), JValue::Int(3)]).unwrap();

    assert_eq!(thread.execute_instruction(), BytecodeAction::ExecuteBytecode);
    assert_eq!(thread.execute_instruction(), BytecodeAction::ExecuteBytecode);
    assert_eq!(thread.operand_stack(), vec![int_to_word(2), int_to_word(3)]);
    assert_eq!(thread.bytecode_pc(), 2);

    assert_eq!(thread.execute_instruction(), BytecodeAction::ExecuteBytecode);
    assert_eq!(thread.operand_stack(), vec![int_to_word(5)]);
    assert_eq!(thread.bytecode_pc(), 3);

    let result = thread.finish(BytecodeAction::ExecuteBytecode).unwrap();
    assert_eq!(result, JValue::Int(5));
}

#[test]
fn test_stepping_division_by_zero_reports_the_throw() {
    let vm = vm();
    define_calc(&vm);
    let div = vm.find_method("demo/Calc", "div", "(II)I").unwrap();
    let mut thread = vm.attach_thread("main");
    thread.enter_method(&div, &[JValue::Int(7), JValue::Int(0)]).unwrap();
    thread.execute_instruction();
    thread.execute_instruction();

    let action = thread.execute_instruction();
    assert_eq!(action, BytecodeAction::ThrowArithmetic);
    assert_eq!(thread.bytecode_pc(), 2);

    let error = thread.finish(action).unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/ArithmeticException"
    );
}

// =============================================================================
// Exceptions
// =============================================================================

#[rstest]
#[case(7, 2, 3)]
#[case(7, 0, -1)]
#[case(i32::MIN, -1, i32::MIN)]
fn test_handler_catches_division_by_zero(#[case] a: i32, #[case] b: i32, #[case] expected: i32) {
    let vm = vm();
    define_calc(&vm);
    let mut thread = vm.attach_thread("main");
    let result = thread
        .call_static("demo/Calc", "safeDiv", "(II)I", &[JValue::Int(a), JValue::Int(b)])
        .unwrap();
    assert_eq!(result, JValue::Int(expected));
}

#[test]
fn test_uncaught_exception_carries_trace() {
    let vm = vm();
    define_calc(&vm);
    let outer = ClassBuilder::new("demo/Outer")
        .method(
            "run",
            "()I",
            PUBLIC_STATIC,
            "bipush 9\n iconst_0\n invokestatic demo/Calc.div(II)I\n ireturn",
        )
        .unwrap()
        .build();
    vm.define_class(outer).unwrap();
    let mut thread = vm.attach_thread("main");

    let error = thread.call_static("demo/Outer", "run", "()I", &[]).unwrap_err();
    let thrown = error.exception().unwrap();
    assert_eq!(thrown.class_name, "java/lang/ArithmeticException");
    assert!(thrown.stack_trace.len() >= 2, "{:?}", thrown.stack_trace);
    assert!(thrown.stack_trace[0].starts_with("demo.Calc.div"));
    assert!(thrown.stack_trace[1].starts_with("demo.Outer.run"));

    // The thread is usable again afterwards.
    let sum = thread
        .call_static("demo/Calc", "add", "(II)I", &[JValue::Int(1), JValue::Int(1)])
        .unwrap();
    assert_eq!(sum, JValue::Int(2));
}

#[test]
fn test_null_receiver_throws_before_dispatch() {
    let vm = vm();
    let base = ClassBuilder::new("demo/Base")
        .method("name", "()I", ACC_PUBLIC, "iconst_1\n ireturn")
        .unwrap()
        .build();
    let user = ClassBuilder::new("demo/User")
        .method(
            "callNull",
            "()I",
            PUBLIC_STATIC,
            "aconst_null\n invokevirtual demo/Base.name()I\n ireturn",
        )
        .unwrap()
        .build();
    vm.define_class(base).unwrap();
    vm.define_class(user).unwrap();
    let mut thread = vm.attach_thread("main");

    let error = thread.call_static("demo/User", "callNull", "()I", &[]).unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/NullPointerException"
    );
}

#[test]
fn test_missing_interface_is_incompatible_class_change() {
    let vm = vm();
    let shape = ClassBuilder::new("demo/Shape")
        .flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .abstract_method("area", "()I")
        .build();
    let plain = ClassBuilder::new("demo/Plain").build();
    let user = ClassBuilder::new("demo/User")
        .method(
            "area",
            "(Ldemo/Shape;)I",
            PUBLIC_STATIC,
            "aload_0\n invokeinterface demo/Shape.area()I\n ireturn",
        )
        .unwrap()
        .build();
    for class in [shape, plain, user] {
        vm.define_class(class).unwrap();
    }
    let mut thread = vm.attach_thread("main");
    let plain = thread.new_instance("demo/Plain").unwrap();

    let error = thread
        .call_static("demo/User", "area", "(Ldemo/Shape;)I", &[JValue::Ref(plain)])
        .unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/IncompatibleClassChangeError"
    );
}

// =============================================================================
// Stack overflow
// =============================================================================

fn define_recursion(vm: &JavaVM) {
    let deep = ClassBuilder::new("demo/Deep")
        .method(
            "deep",
            "(I)I",
            PUBLIC_STATIC,
            "iload_0\n iconst_1\n iadd\n invokestatic demo/Deep.deep(I)I\n ireturn",
        )
        .unwrap()
        .method(
            "safe",
            "()I",
            PUBLIC_STATIC,
            "
        start:
            iconst_0
            invokestatic demo/Deep.deep(I)I
            ireturn
        end:
        handler:
            pop
            iconst_m1
            ireturn
            .catch java/lang/StackOverflowError from start to end using handler
            ",
        )
        .unwrap()
        .build();
    vm.define_class(deep).unwrap();
}

#[rstest]
#[case(GrowthPolicy::Grow)]
#[case(GrowthPolicy::FailFast)]
fn test_unbounded_recursion_is_catchable(#[case] growth: GrowthPolicy) {
    let mut config = interpreter_config();
    config.stack.growth = growth;
    let initial = config.stack.initial_words;
    let vm = JavaVM::new(config).unwrap();
    define_recursion(&vm);
    let mut thread = vm.attach_thread("main");

    for _ in 0..2 {
        let result = thread.call_static("demo/Deep", "safe", "()I", &[]).unwrap();
        assert_eq!(result, JValue::Int(-1));
    }
    match growth {
        GrowthPolicy::Grow => assert!(thread.stack_capacity() > initial),
        GrowthPolicy::FailFast => assert_eq!(thread.stack_capacity(), initial),
    }
}

#[test]
fn test_growth_keeps_operands_across_the_resumed_call() {
    let mut config = interpreter_config();
    config.stack.growth = GrowthPolicy::Grow;
    config.stack.max_words = 64 * 1024;
    let initial = config.stack.initial_words;
    let vm = JavaVM::new(config).unwrap();
    let class = ClassBuilder::new("demo/Sum")
        .method(
            "sum",
            "(I)I",
            PUBLIC_STATIC,
            "
            iload_0
            ifle base
            iload_0
            iload_0
            iconst_1
            isub
            invokestatic demo/Sum.sum(I)I
            iadd
            ireturn
        base:
            iconst_0
            ireturn
            ",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
    let mut thread = vm.attach_thread("main");

    // Every frame holds `n` under the call while the stack grows beneath it.
    let result = thread.call_static("demo/Sum", "sum", "(I)I", &[JValue::Int(1000)]).unwrap();
    assert_eq!(result, JValue::Int(500500));
    assert!(thread.stack_capacity() > initial);
}

#[test]
fn test_uncaught_overflow_reaches_the_embedder() {
    let vm = vm();
    define_recursion(&vm);
    let mut thread = vm.attach_thread("main");
    let error = thread
        .call_static("demo/Deep", "deep", "(I)I", &[JValue::Int(0)])
        .unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/StackOverflowError"
    );
    // A second overflow after the first was handled is again an exception.
    let error = thread
        .call_static("demo/Deep", "deep", "(I)I", &[JValue::Int(0)])
        .unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/StackOverflowError"
    );
}

// =============================================================================
// Arithmetic and array edge cases
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_division_matches_wrapping_semantics(a: i32, b in prop_oneof![Just(0), Just(-1), any::<i32>()]) {
        let vm = vm();
        define_calc(&vm);
        let mut thread = vm.attach_thread("main");
        let args = [JValue::Int(a), JValue::Int(b)];
        let quotient = thread.call_static("demo/Calc", "div", "(II)I", &args);
        let remainder = thread.call_static("demo/Calc", "rem", "(II)I", &args);
        if b == 0 {
            for result in [quotient, remainder] {
                let error = result.unwrap_err();
                prop_assert_eq!(
                    error.exception().map(|e| e.class_name.as_str()),
                    Some("java/lang/ArithmeticException")
                );
            }
        } else {
            prop_assert_eq!(quotient.unwrap(), JValue::Int(a.wrapping_div(b)));
            prop_assert_eq!(remainder.unwrap(), JValue::Int(a.wrapping_rem(b)));
        }
    }

    #[test]
    fn prop_array_index_is_bounds_checked(length in -2i32..12, index in -3i32..15) {
        let vm = vm();
        define_calc(&vm);
        let mut thread = vm.attach_thread("main");
        let result = thread.call_static(
            "demo/Calc",
            "element",
            "(II)I",
            &[JValue::Int(length), JValue::Int(index)],
        );
        if length < 0 {
            let error = result.unwrap_err();
            prop_assert_eq!(
                error.exception().map(|e| e.class_name.as_str()),
                Some("java/lang/NegativeArraySizeException")
            );
        } else if index < 0 || index >= length {
            let error = result.unwrap_err();
            let thrown = error.exception().unwrap();
            prop_assert_eq!(thrown.class_name.as_str(), "java/lang/ArrayIndexOutOfBoundsException");
            let expected = format!("Index {} out of bounds for length {}", index, length);
            prop_assert_eq!(thrown.message.as_deref(), Some(expected.as_str()));
        } else {
            prop_assert_eq!(result.unwrap(), JValue::Int(0));
        }
    }
}
