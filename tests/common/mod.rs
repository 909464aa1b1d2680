#![allow(dead_code)]

use std::io::Write;
use std::ops::Deref;
use std::path::Path;
use tempfile::{Builder, NamedTempFile, TempDir};
use vudo_runtime::{LoadOptions, Loader, Spirit};

pub struct TestFile(NamedTempFile);

impl Deref for TestFile {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.0.path()
    }
}

pub fn create_toml_test_file(content: &str) -> TestFile {
    let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
    write!(temp_file, "{}", content).unwrap();
    TestFile(temp_file)
}

pub fn create_wasm_test_file(content: &str) -> TestFile {
    let module_bytes = wat::parse_str(content).unwrap();
    let mut temp_file = Builder::new().suffix(".wasm").tempfile().unwrap();
    temp_file.write_all(&module_bytes).unwrap();
    TestFile(temp_file)
}

/// Write `wat` as `<name>.wasm` inside `dir`.
pub fn write_wasm(dir: &TempDir, name: &str, wat: &str) {
    let bytes = wat::parse_str(wat).unwrap();
    std::fs::write(dir.path().join(format!("{name}.wasm")), bytes).unwrap();
}

pub fn load(wat: &str) -> Spirit {
    load_with(wat, &LoadOptions::default())
}

pub fn load_with(wat: &str, options: &LoadOptions) -> Spirit {
    let bytes = wat::parse_str(wat).unwrap();
    Loader::new().unwrap().load(&bytes, options).unwrap()
}

pub const EMPTY_WAT: &str = "(module)";

pub const CALC_WAT: &str = r#"
    (module
        (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add)
        (func (export "mul") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.mul)
        (func (export "wide") (param i64) (result i64)
            local.get 0
            i64.const 2
            i64.mul)
        (func (export "half") (param f64) (result f64)
            local.get 0
            f64.const 0.5
            f64.mul)
        (global (export "counter") i32 (i32.const 0))
        (func (export "crash")
            unreachable)
    )
"#;

pub const MAIN_WAT: &str = r#"
    (module
        (func (export "helper") (result i32) i32.const 1)
        (func (export "main") (result i32) i32.const 7)
    )
"#;

pub const GREETER_WAT: &str = r#"
    (module
        (import "env" "memory" (memory 1))
        (import "env" "vudo_print" (func $print (param i32 i32)))
        (import "env" "vudo_debug" (func $debug (param i32 i32)))
        (data (i32.const 16) "hello")
        (data (i32.const 32) "whisper")
        (func (export "greet")
            i32.const 16
            i32.const 5
            call $print
            i32.const 32
            i32.const 7
            call $debug)
    )
"#;

pub const ABORT_WAT: &str = r#"
    (module
        (import "env" "memory" (memory 1))
        (import "env" "vudo_abort" (func $abort (param i32 i32 i32 i32 i32)))
        (data (i32.const 16) "boom")
        (data (i32.const 32) "main.dol")
        (func (export "fail")
            i32.const 16
            i32.const 4
            i32.const 32
            i32.const 8
            i32.const 42
            call $abort
            unreachable)
    )
"#;

pub const ALLOC_WAT: &str = r#"
    (module
        (import "env" "memory" (memory 1))
        (import "env" "vudo_alloc" (func $alloc (param i32) (result i32)))
        (func (export "grab") (param i32) (result i32)
            local.get 0
            call $alloc)
    )
"#;

pub const HOST_SERVICES_WAT: &str = r#"
    (module
        (import "env" "vudo_now" (func $now (result i64)))
        (import "env" "vudo_random" (func $random (result f64)))
        (import "env" "vudo_emit_effect" (func $emit (param i32 i32) (result i32)))
        (func (export "now") (result i64) call $now)
        (func (export "random") (result f64) call $random)
        (func (export "emit") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            call $emit)
    )
"#;

/// Brings its own memory instead of importing the host's.
pub const OWN_MEMORY_WAT: &str = r#"
    (module
        (import "env" "vudo_alloc" (func $alloc (param i32) (result i32)))
        (memory (export "memory") 1)
        (func (export "store") (param i32 i32)
            local.get 0
            local.get 1
            i32.store)
        (func (export "grab") (param i32) (result i32)
            local.get 0
            call $alloc)
    )
"#;

pub const DOUBLER_WAT: &str = r#"
    (module
        (import "env" "host_double" (func $double (param i32) (result i32)))
        (func (export "quad") (param i32) (result i32)
            local.get 0
            call $double
            call $double)
    )
"#;

pub const UNRESOLVED_WAT: &str = r#"
    (module
        (import "env" "nowhere" (func (param i32)))
    )
"#;

pub const ADD64_WAT: &str = r#"
    (module
        (func (export "add") (param i64 i64) (result i64)
            local.get 0
            local.get 1
            i64.add)
    )
"#;

pub const MULTIPLY_WAT: &str = r#"
    (module
        (func (export "multiply") (param i64 i64) (result i64)
            local.get 0
            local.get 1
            i64.mul)
    )
"#;
