// Integration tests for the Panda interpreter.
//
// Exercised through the public `panda` binary rather than internal VM
// state, since the VM intentionally keeps its stack/heap/globals
// private (`Vm::new`/`Vm::interpret` are the whole embedding surface) —
// running real scripts and checking stdout/exit code is the same black
// box a script author sees.

use std::io::Write;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};

fn run(source: &str) -> Output {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("panda_vm_test_{}_{id}.panda", std::process::id()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
    }
    let output = Command::new(env!("CARGO_BIN_EXE_panda")).arg(&path).output().unwrap();
    let _ = std::fs::remove_file(&path);
    output
}

fn stdout(source: &str) -> String {
    let output = run(source);
    assert!(output.status.success(), "expected success, stderr: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn arithmetic_respects_precedence() {
    assert_eq!(stdout("print 1 + 2 * 3 - 4 / 2;"), "5\n");
}

#[test]
fn string_concatenation_with_plus() {
    assert_eq!(stdout(r#"print "foo" + "bar";"#), "foobar\n");
}

#[test]
fn closures_capture_upvalues_across_calls() {
    let source = r#"
        fun makeCounter() {
            var i = 0;
            fun count() {
                i = i + 1;
                return i;
            }
            return count;
        }
        var counter = makeCounter();
        print counter();
        print counter();
        print counter();
    "#;
    assert_eq!(stdout(source), "1\n2\n3\n");
}

#[test]
fn upvalue_survives_enclosing_scope_exit() {
    let source = r#"
        fun outer() {
            var x = "captured";
            fun inner() {
                return x;
            }
            return inner;
        }
        var f = outer();
        print f();
    "#;
    assert_eq!(stdout(source), "captured\n");
}

#[test]
fn single_inheritance_resolves_method_and_init() {
    let source = r#"
        class Animal {
            init(name) { this.name = name; }
            speak() { return this.name + " makes a sound"; }
        }
        class Dog < Animal {}
        var d = Dog("Rex");
        print d.speak();
    "#;
    assert_eq!(stdout(source), "Rex makes a sound\n");
}

#[test]
fn super_call_reaches_parent_method() {
    let source = r#"
        class Animal {
            speak() { return "..."; }
        }
        class Dog < Animal {
            speak() { return super.speak() + " woof"; }
        }
        print Dog().speak();
    "#;
    assert_eq!(stdout(source), "... woof\n");
}

#[test]
fn for_loop_desugars_to_correct_iteration_count() {
    let source = r#"
        var total = 0;
        for (var i = 0; i < 5; i = i + 1) {
            total = total + i;
        }
        print total;
    "#;
    assert_eq!(stdout(source), "10\n");
}

#[test]
fn instance_fields_are_independent_per_instance() {
    let source = r#"
        class Box {}
        var a = Box();
        var b = Box();
        a.value = 1;
        b.value = 2;
        print a.value;
        print b.value;
    "#;
    assert_eq!(stdout(source), "1\n2\n");
}

#[test]
fn runtime_type_error_on_plus_exits_70() {
    let output = run(r#"print 1 + "two";"#);
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Operands must be"), "stderr was: {stderr}");
}

#[test]
fn undefined_property_access_exits_70() {
    let output = run("class Foo {} var f = Foo(); print f.bar;");
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn undefined_global_gets_a_did_you_mean_suggestion() {
    let output = run("var total = 0; print totla;");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Did you mean 'total'?"), "stderr was: {stderr}");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let output = run("fun recurse(n) { return recurse(n + 1); } recurse(0);");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Stack overflow"), "stderr was: {stderr}");
}

#[test]
fn compile_error_exits_65() {
    let output = run("var x = ;");
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn more_than_one_file_argument_is_a_usage_error() {
    let path = std::env::temp_dir().join(format!("panda_vm_test_usage_{}.panda", std::process::id()));
    std::fs::write(&path, "print 1;\n").unwrap();
    let output =
        Command::new(env!("CARGO_BIN_EXE_panda")).arg(&path).arg(&path).output().unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_panda")).arg("--not-a-real-flag").output().unwrap();
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn clock_returns_elapsed_seconds_since_start_not_an_epoch_timestamp() {
    let value = stdout("print clock();").trim().parse::<f64>().unwrap();
    assert!(value >= 0.0 && value < 60.0, "clock() returned {value}, expected a small elapsed value");
}

#[test]
fn gc_stress_mode_preserves_program_semantics() {
    let output = Command::new(env!("CARGO_BIN_EXE_panda")).arg("--stress-gc").arg({
        let path = std::env::temp_dir().join(format!("panda_vm_test_stress_{}.panda", std::process::id()));
        std::fs::write(&path, "var total = 0;\nfor (var i = 0; i < 100; i = i + 1) {\n  total = total + i;\n}\nprint total;\n").unwrap();
        path
    }).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "4950\n");
}

#[test]
fn disassemble_flag_prints_bytecode_listing_and_still_runs() {
    let path = std::env::temp_dir().join(format!("panda_vm_test_disasm_{}.panda", std::process::id()));
    std::fs::write(&path, "print 1 + 2;\n").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_panda")).arg("--disassemble").arg(&path).output().unwrap();
    let _ = std::fs::remove_file(&path);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("== <script> =="));
    assert!(stdout.contains("OP_ADD"));
    assert!(stdout.contains("3\n"));
}
