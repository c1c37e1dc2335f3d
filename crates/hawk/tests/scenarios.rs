//! End-to-end scenarios and boundary behaviors run against the public API,
//! the way the teacher crate's `tests/parse_errors.rs` / `tests/heap_stats.rs`
//! exercise the whole pipeline rather than one module in isolation.

use hawk::io::{MemorySourceIo, RioDomain, RioHandler, RioMode, Utf8CharManager};
use hawk::modules::ModuleRegistry;
use hawk::parser::Parser;
use hawk::value::immediate;
use hawk::{ErrorKind, HawkResult, Options};

struct TestRio {
    input_lines: Vec<Vec<u8>>,
    input_pos: usize,
    output: Vec<u8>,
}

impl TestRio {
    fn with_input(text: &str) -> Self {
        let mut lines: Vec<Vec<u8>> = text.split_inclusive('\n').map(|l| l.as_bytes().to_vec()).collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        Self { input_lines: lines, input_pos: 0, output: Vec::new() }
    }
}

impl RioHandler for TestRio {
    fn open(&mut self, _name: &str, _mode: RioMode, _domain: RioDomain) -> HawkResult<u64> {
        Ok(0)
    }
    fn close(&mut self, _handle: u64) -> HawkResult<()> {
        Ok(())
    }
    fn read(&mut self, _handle: u64) -> HawkResult<Option<Vec<u8>>> {
        if self.input_pos >= self.input_lines.len() {
            return Ok(None);
        }
        let line = self.input_lines[self.input_pos].clone();
        self.input_pos += 1;
        Ok(Some(line))
    }
    fn write(&mut self, _handle: u64, data: &[u8]) -> HawkResult<usize> {
        self.output.extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self, _handle: u64) -> HawkResult<()> {
        Ok(())
    }
}

fn run_program(source: &str, input: &str) -> String {
    run_program_with(MemorySourceIo::new().with_main(source), input)
}

fn run_program_with(mut io: MemorySourceIo, input: &str) -> String {
    let options = Options::default();
    let mut parser = Parser::new(&mut io, &options).unwrap();
    let program = parser.parse_program().unwrap();
    let modules = ModuleRegistry::new();
    let mut rio = TestRio::with_input(input);
    let cmgr = Utf8CharManager;
    let mut engine = hawk::Engine::new(program, &options, modules, &mut rio, &cmgr);
    engine.run().unwrap();
    String::from_utf8(rio.output).unwrap()
}

// ---- §8.3 end-to-end scenarios not already covered in-module -------------

#[test]
fn field_split_with_nf_and_last_field() {
    let out = run_program("{ print NF, $1, $NF }", "one two three\n");
    assert_eq!(out, "3 one three\n");
}

#[test]
fn constant_folding_mixed_arithmetic() {
    let out = run_program(r"BEGIN { print 1 + 2 * 3, 10 / 3, 10 \ 3, 10 % 3 }", "");
    assert_eq!(out, "7 3.3333333333333335 3 1\n");
}

#[test]
fn include_once_runs_library_initializer_a_single_time() {
    let io = MemorySourceIo::new()
        .with_main(r#"@include_once "lib.awk"; @include_once "lib.awk"; BEGIN { print N }"#)
        .with_named("lib.awk", "BEGIN { N++ }");
    let out = run_program_with(io, "");
    assert_eq!(out, "1\n");
}

#[test]
fn plain_include_reenters_every_time() {
    let io = MemorySourceIo::new()
        .with_main(r#"@include "lib.awk"; @include "lib.awk"; BEGIN { print N }"#)
        .with_named("lib.awk", "BEGIN { N++ }");
    let out = run_program_with(io, "");
    assert_eq!(out, "2\n");
}

// ---- §8.2 boundary behaviors -----------------------------------------------

#[test]
fn immediate_int_boundary_round_trips_as_immediate() {
    assert!(immediate::in_range(immediate::QINT_MAX));
    assert!(immediate::in_range(immediate::QINT_MIN));
}

#[test]
fn one_past_immediate_boundary_is_out_of_range() {
    assert!(!immediate::in_range(immediate::QINT_MAX + 1));
    assert!(!immediate::in_range(immediate::QINT_MIN - 1));
}

#[test]
fn literal_division_by_zero_is_a_parse_time_error() {
    let mut io = MemorySourceIo::new().with_main("BEGIN { x = 10 / 0 }");
    let options = Options::default();
    let mut parser = Parser::new(&mut io, &options).unwrap();
    let err = parser.parse_program().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
}

#[test]
fn runtime_division_by_zero_is_a_runtime_error() {
    let mut io = MemorySourceIo::new().with_main("BEGIN { y = 0; x = 10 / y }");
    let options = Options::default();
    let mut parser = Parser::new(&mut io, &options).unwrap();
    let program = parser.parse_program().unwrap();
    let modules = ModuleRegistry::new();
    let mut rio = TestRio::with_input("");
    let cmgr = Utf8CharManager;
    let mut engine = hawk::Engine::new(program, &options, modules, &mut rio, &cmgr);
    let err = engine.run().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
}

#[test]
fn empty_program_runs_with_no_output() {
    let out = run_program("", "one\ntwo\nthree\n");
    assert_eq!(out, "");
}

// ---- §8.4-style property checks (small, deterministic samples) -----------

#[test]
fn folded_integer_arithmetic_matches_reference_evaluator() {
    let cases: &[(&str, i64)] = &[
        ("1+2*3", 7),
        ("(1+2)*3", 9),
        ("10-3-2", 5),
        ("2*3*4", 24),
        ("100-99-1", 0),
    ];
    for (expr, expected) in cases {
        let out = run_program(&format!("BEGIN {{ print {expr} }}"), "");
        assert_eq!(out, format!("{expected}\n"), "expression {expr} folded wrong");
    }
}

#[test]
fn map_insert_lookup_delete_matches_reference_behavior() {
    let out = run_program(
        r#"
        BEGIN {
            for (i = 1; i <= 5; i++) a[i] = i * i;
            delete a[3];
            n = 0;
            for (k in a) n++;
            print n, (3 in a), a[4];
        }
        "#,
        "",
    );
    assert_eq!(out, "4 0 16\n");
}
