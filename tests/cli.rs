use std::io::Write;
use std::process::Command;

fn moonbridge() -> Command {
    Command::new(env!("CARGO_BIN_EXE_moonbridge"))
}

// --- Inline code ---

#[test]
fn inline_prints_results() {
    let out = moonbridge()
        .args(["-e", "return 1 + 2, 'three'"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "3\tthree");
}

#[test]
fn inline_receives_trailing_args() {
    let out = moonbridge()
        .args(["-e", "return tonumber(...[1]) + tonumber(...[2])", "4", "5"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "9");
}

#[test]
fn inline_print_goes_to_stdout() {
    let out = moonbridge()
        .args(["-e", "print('hello', 42)"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello\t42");
}

// --- JSON output ---

#[test]
fn json_converts_tables() {
    let out = moonbridge()
        .args(["--json", "-e", "return {name = 'moon', list = {1, 2, 3}}, 7"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout is JSON");
    assert_eq!(json[0]["name"], "moon");
    assert_eq!(json[0]["list"], serde_json::json!([1, 2, 3]));
    assert_eq!(json[1], 7);
}

#[test]
fn emit_ast_outputs_json() {
    let out = moonbridge()
        .args(["--emit", "ast", "-e", "local x = 1"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("\"body\""), "expected AST JSON, got: {}", stdout);
}

// --- Errors ---

#[test]
fn compile_error_shows_the_line() {
    let out = moonbridge()
        .args(["-e", "x = = 1"])
        .output()
        .expect("failed to run moonbridge");
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("=(command line):1:"), "stderr: {}", stderr);
    assert!(stderr.contains("x = = 1"), "stderr: {}", stderr);
}

#[test]
fn runtime_error_exits_nonzero() {
    let out = moonbridge()
        .args(["-e", "error('nope')"])
        .output()
        .expect("failed to run moonbridge");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope"));
}

#[test]
fn missing_input_is_an_error() {
    let out = moonbridge().output().expect("failed to run moonbridge");
    assert!(!out.status.success());
}

// --- Files and config ---

#[test]
fn runs_a_script_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "local n = select('#', ...)").unwrap();
    writeln!(file, "return n, ...").unwrap();
    let out = moonbridge()
        .arg(file.path())
        .args(["a", "b"])
        .output()
        .expect("failed to run moonbridge");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "2\ta\tb");
}

#[test]
fn config_limits_call_depth() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{"max_call_depth": 10, "open_libs": true}}"#).unwrap();
    let out = moonbridge()
        .arg("--config")
        .arg(config.path())
        .args(["-e", "local function f(n) return f(n + 1) end return f(1)"])
        .output()
        .expect("failed to run moonbridge");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("stack overflow"));
}

#[test]
fn bad_config_is_rejected() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{"unknown": 1}}"#).unwrap();
    let out = moonbridge()
        .arg("--config")
        .arg(config.path())
        .args(["-e", "return 1"])
        .output()
        .expect("failed to run moonbridge");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("bad config"));
}
