use std::path::PathBuf;
use std::process::{Command, Output};

use serde_json::Value;

fn quill_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_quill"))
}

fn sample(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/samples")
        .join(path)
}

fn transpile(name: &str) -> String {
    let output = run(&["transpile", sample(name).to_str().unwrap()]);
    assert!(
        output.status.success(),
        "quill transpile failed: stdout={:?} stderr={:?}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn run(args: &[&str]) -> Output {
    Command::new(quill_bin())
        .args(args)
        .output()
        .expect("failed to run quill binary")
}

/// Runs `quill ast` on a copy of the sample and parses the produced JSON.
fn ast_of(name: &str) -> Value {
    let scratch = std::env::temp_dir().join(format!("quill-test-{}-{name}", std::process::id()));
    std::fs::copy(sample(name), &scratch).expect("could not stage sample");
    let output = run(&["ast", scratch.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "quill ast failed: stderr={:?}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json_path = format!("{}.ast.json", scratch.display());
    let data = std::fs::read_to_string(&json_path).expect("ast json missing");
    let _ = std::fs::remove_file(&json_path);
    let _ = std::fs::remove_file(&scratch);
    serde_json::from_str(&data).expect("ast json does not parse")
}

#[test]
fn hello_world_transpiles_to_a_runtime_log() {
    let out = transpile("hello.ql");
    assert!(out.starts_with("package main"), "missing package clause");
    assert!(out.contains("QLlogValues(\"hi\")"), "got:\n{out}");
    assert!(out.contains("func main() {"), "got:\n{out}");
}

#[test]
fn typed_arithmetic_elides_runtime_casts() {
    let out = transpile("arithmetic.ql");
    assert!(out.contains("var x int"), "got:\n{out}");
    assert!(out.contains("var y float64"), "got:\n{out}");
    assert!(out.contains("(float64(x) + y)"), "got:\n{out}");
    assert!(
        !out.contains("QLcastNumber(x)"),
        "cast should be elided:\n{out}"
    );
}

#[test]
fn drawing_program_uses_the_window_entrypoint() {
    let out = transpile("drawing.ql");
    assert!(out.contains("window.Create(QLsetup)"), "got:\n{out}");
    assert!(out.contains("QLdrawctx.Rect("), "got:\n{out}");
    // the colour modifier emits before the square
    let color = out.find("QLdrawctx.Color").expect("modifier compiled");
    let rect = out.find("QLdrawctx.Rect").expect("rect compiled");
    assert!(color < rect, "modifier must precede its statement:\n{out}");
}

#[test]
fn plain_program_uses_the_plain_entrypoint() {
    let out = transpile("plain.ql");
    assert!(!out.contains("window.Create"), "got:\n{out}");
    assert!(out.contains("func main() {"), "got:\n{out}");
}

#[test]
fn string_method_lowering() {
    let out = transpile("string_method.ql");
    assert!(out.contains("strings.ToLower(\"ABC\")"), "got:\n{out}");
}

#[test]
fn array_sort_uses_the_runtime_helper() {
    let out = transpile("sort.ql");
    assert!(out.contains("QLsort("), "got:\n{out}");
}

#[test]
fn ternary_lowering() {
    let out = transpile("ternary.ql");
    assert!(
        out.contains("if 5 > 3 { return \"y\" } else { return \"n\" }"),
        "got:\n{out}"
    );
}

#[test]
fn subscript_chain_lowers_through_get_item() {
    let out = transpile("chain.ql");
    assert!(out.contains("QLtoString(QLgetItem(x, 1))"), "got:\n{out}");
}

#[test]
fn record_type_lowers_to_struct_constructor_and_setter() {
    let out = transpile("record.ql");
    assert!(out.contains("type QL_Point struct {"), "got:\n{out}");
    assert!(out.contains("func QL_new_Point() *QL_Point {"), "got:\n{out}");
    assert!(out.contains("QLsetItem(p, \"x\", 4)"), "got:\n{out}");
}

#[test]
fn custom_command_compiles_and_dispatches() {
    let out = transpile("commands.ql");
    assert!(out.contains("func QLCMD_greet(name any)"), "got:\n{out}");
    assert!(out.contains("QLCMD_greet(\"world\")"), "got:\n{out}");
}

#[test]
fn worker_program_uses_the_safe_map_and_worker_pump() {
    let out = transpile("worker.ql");
    assert!(out.contains("QLnewSafeMap(map[string]any{"), "got:\n{out}");
    assert!(out.contains("QLworker("), "got:\n{out}");
    assert!(out.contains("QLsetItem(w, \"alive\", false)"), "got:\n{out}");
}

#[test]
fn malformed_source_fails_with_a_line_diagnostic() {
    let output = run(&["transpile", sample("malformed.ql").to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(65), "expected exit code 65");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Line 1"), "got stderr: {stderr:?}");
    assert!(stderr.contains("Malformed"), "got stderr: {stderr:?}");
    // first-error-wins: no partial output
    assert!(output.stdout.is_empty(), "no partial output expected");
}

#[test]
fn missing_file_fails_with_io_exit_code() {
    let output = run(&["transpile", "does-not-exist.ql"]);
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn version_prints_the_crate_version() {
    let output = run(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "got: {stdout:?}"
    );
}

#[test]
fn ast_json_reflects_operator_precedence() {
    let ast = ast_of("precedence.ql");
    let statement = &ast[0][0];
    assert_eq!(statement["type"], "asi");
    let right = &statement["right"];
    assert_eq!(right["type"], "opr");
    assert_eq!(right["data"], "+");
    assert_eq!(right["right"]["type"], "opr");
    assert_eq!(right["right"]["data"], "*");
}

#[test]
fn ast_json_lowers_subscripts_to_item_segments() {
    let ast = ast_of("chain.ql");
    // second statement: log x[1].toStr
    let chain = &ast[1][1];
    assert_eq!(chain["type"], "mtd");
    let segments = chain["data"].as_array().expect("segments");
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0]["type"], "var");
    assert_eq!(segments[0]["data"], "x");
    assert_eq!(segments[1]["type"], "mtv");
    assert_eq!(segments[1]["data"], "item");
    assert_eq!(segments[2]["type"], "var");
    assert_eq!(segments[2]["data"], "toStr");
}

#[test]
fn ast_json_omits_empty_slots() {
    let ast = ast_of("hello.ql");
    let head = &ast[0][0];
    assert_eq!(head["type"], "cmd");
    assert!(head.get("left").is_none(), "empty slots must be omitted");
    assert!(head.get("parse_error").is_none());
}
