use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

const IMAGE: &str = r#"
main_class = "demo/Main"

[[class]]
name = "demo/Main"

[[class.method]]
name = "main"
descriptor = "()I"
flags = ["public", "static"]
code = """
    iconst_0
    istore_0
    iconst_0
    istore_1
loop:
    iload_1
    bipush 10
    if_icmpge done
    iload_0
    iload_1
    invokestatic demo/Main.twice(I)I
    iadd
    istore_0
    iinc 1 1
    goto loop
done:
    iload_0
    ireturn
"""

[[class.method]]
name = "twice"
descriptor = "(I)I"
flags = ["public", "static"]
code = """
    iload_0
    iconst_2
    imul
    ireturn
"""

[[class]]
name = "demo/Fails"

[[class.method]]
name = "main"
descriptor = "()V"
flags = ["public", "static"]
code = """
    iconst_1
    iconst_0
    idiv
    pop
    return
"""
"#;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn run_jexec(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_jexec"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute jexec");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str]) -> String {
    let (stdout, stderr, success) = run_jexec(args);
    assert!(success, "jexec should succeed, stderr:\n{}", stderr);
    stdout
}

fn assert_failure(args: &[&str]) -> String {
    let (_, stderr, success) = run_jexec(args);
    assert!(!success, "jexec should fail");
    stderr
}

#[test]
fn test_run_prints_int_result() {
    let image = write_temp(IMAGE);
    let path = image.path().to_str().unwrap();
    for jit in ["off", "on", "auto"] {
        let stdout = assert_success(&["run", path, "--jit", jit, "--jit-threshold", "2"]);
        assert_eq!(stdout, "90\n");
    }
}

#[test]
fn test_stats_are_json() {
    let image = write_temp(IMAGE);
    let path = image.path().to_str().unwrap();
    let stdout = assert_success(&["run", path, "--jit", "off", "--stats"]);
    let (result, stats) = stdout.split_once('\n').unwrap();
    assert_eq!(result, "90");
    let stats: serde_json::Value = serde_json::from_str(stats).unwrap();
    assert_eq!(stats["transitions"]["compiles"], 0);
    assert_eq!(stats["compiled_methods"], 0);
    assert!(stats["classes"].as_u64().unwrap() > 2);
}

#[test]
fn test_config_file_sets_threshold() {
    let image = write_temp(IMAGE);
    let config = write_temp("jit_mode = \"on\"\njit_threshold = 1\n");
    let stdout = assert_success(&[
        "run",
        image.path().to_str().unwrap(),
        "--config",
        config.path().to_str().unwrap(),
        "--stats",
    ]);
    let (result, stats) = stdout.split_once('\n').unwrap();
    assert_eq!(result, "90");
    let stats: serde_json::Value = serde_json::from_str(stats).unwrap();
    assert!(stats["transitions"]["compiles"].as_u64().unwrap() >= 1);
}

#[test]
fn test_uncaught_exception_fails() {
    let image = write_temp(IMAGE);
    let stderr = assert_failure(&["run", image.path().to_str().unwrap(), "--class", "demo/Fails"]);
    assert!(stderr.contains("java.lang.ArithmeticException"), "stderr: {}", stderr);
}

#[test]
fn test_missing_class_fails() {
    let image = write_temp(IMAGE);
    let stderr = assert_failure(&["run", image.path().to_str().unwrap(), "--class", "demo/Nope"]);
    assert!(stderr.contains("demo/Nope"), "stderr: {}", stderr);
}

#[test]
fn test_bad_image_fails() {
    let image = write_temp("[[class]]\nname = \"a/A\"\nflags = [\"sealed\"]\n");
    let stderr = assert_failure(&["run", image.path().to_str().unwrap(), "--class", "a/A"]);
    assert!(stderr.contains("unknown flag 'sealed'"), "stderr: {}", stderr);
}

#[test]
fn test_disasm_lists_every_method() {
    let image = write_temp(IMAGE);
    let stdout = assert_success(&["disasm", image.path().to_str().unwrap()]);
    assert!(stdout.contains("class demo/Main"));
    assert!(stdout.contains("  twice(I)I"));
    assert!(stdout.contains("invokestatic"));
    assert!(stdout.contains("class demo/Fails"));
}
