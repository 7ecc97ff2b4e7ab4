use jexec::{ClassBuilder, JValue, JavaVM, JitMode, RuntimeConfig, VmResult};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    jexec_jit_on_secs: f64,
    jexec_jit_off_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() -> i64 {
    let mut sum: i64 = 0;
    for i in 1..=1_000_000 {
        sum += i;
    }
    sum
}

fn rust_nested_loop() -> i32 {
    let mut sum: i32 = 0;
    for i in 0..500 {
        for j in 0..500 {
            sum = sum.wrapping_add(i * j);
        }
    }
    sum
}

fn rust_fibonacci(n: i32) -> i32 {
    if n <= 1 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

// Bytecode versions

const SUM_LOOP: &str = "
    lconst_0
    lstore_0
    iconst_1
    istore_2
loop:
    iload_2
    ldc 1000000
    if_icmpgt done
    lload_0
    iload_2
    i2l
    ladd
    lstore_0
    iinc 2 1
    goto loop
done:
    lload_0
    lreturn
";

const NESTED_LOOP: &str = "
    iconst_0
    istore_0
    iconst_0
    istore_1
outer:
    iload_1
    sipush 500
    if_icmpge done
    iconst_0
    istore_2
inner:
    iload_2
    sipush 500
    if_icmpge next
    iload_0
    iload_1
    iload_2
    imul
    iadd
    istore_0
    iinc 2 1
    goto inner
next:
    iinc 1 1
    goto outer
done:
    iload_0
    ireturn
";

const FIBONACCI: &str = "
    iload_0
    iconst_1
    if_icmpgt recurse
    iload_0
    ireturn
recurse:
    iload_0
    iconst_1
    isub
    invokestatic bench/Programs.fib(I)I
    iload_0
    iconst_2
    isub
    invokestatic bench/Programs.fib(I)I
    iadd
    ireturn
";

fn define_programs(vm: &JavaVM) -> VmResult<()> {
    let flags = jexec::vm::classfile::ACC_PUBLIC | jexec::vm::classfile::ACC_STATIC;
    let class = ClassBuilder::new("bench/Programs")
        .method("sumLoop", "()J", flags, SUM_LOOP)?
        .method("nestedLoop", "()I", flags, NESTED_LOOP)?
        .method("fib", "(I)I", flags, FIBONACCI)?
        .build();
    vm.define_class(class)?;
    Ok(())
}

fn time_rust<F, T>(f: F) -> f64
where
    F: FnOnce() -> T,
    T: std::fmt::Display,
{
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("{}", result);
    elapsed
}

fn run_jexec_benchmark(method: &str, descriptor: &str, args: &[JValue], jit_enabled: bool) -> f64 {
    let config = RuntimeConfig {
        jit_mode: if jit_enabled { JitMode::On } else { JitMode::Off },
        jit_threshold: 1, // Compile almost immediately for benchmarking
        ..Default::default()
    };

    let start = Instant::now();
    let result = JavaVM::new(config).and_then(|vm| {
        define_programs(&vm)?;
        let mut thread = vm.attach_thread("bench");
        thread.call_static("bench/Programs", method, descriptor, args)
    });
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(value) => eprintln!("{:?}", value),
        Err(e) => eprintln!("jexec benchmark {} (jit={}) failed: {}", method, jit_enabled, e),
    }

    elapsed
}

fn main() {
    let cases: [(&str, &str, &str, Vec<JValue>, fn() -> f64); 3] = [
        ("sum_loop", "sumLoop", "()J", vec![], || time_rust(rust_sum_loop)),
        ("nested_loop", "nestedLoop", "()I", vec![], || time_rust(rust_nested_loop)),
        ("fibonacci", "fib", "(I)I", vec![JValue::Int(25)], || {
            time_rust(|| rust_fibonacci(25))
        }),
    ];

    let mut results = Vec::new();
    for (name, method, descriptor, args, rust) in cases {
        let rust_time = rust();
        let jit_on = run_jexec_benchmark(method, descriptor, &args, true);
        let jit_off = run_jexec_benchmark(method, descriptor, &args, false);
        results.push(BenchmarkResult {
            name: name.to_string(),
            jexec_jit_on_secs: jit_on,
            jexec_jit_off_secs: jit_off,
            rust_time_secs: rust_time,
        });
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("cannot serialize results: {}", e),
    }
}
