//! Source-to-exit-value scenarios across the whole pipeline:
//! parse -> compile -> serialize -> load -> execute.

use khronicler::{
    BuildError, CollectStringPrint, Image, Machine, RuntimeError, SemanticError, SyntaxError,
    build,
};
use pretty_assertions::assert_eq;

fn run_exit(source: &str) -> i32 {
    let bytes = build(source).expect("builds");
    let image = Image::load(&bytes).expect("loads");
    let mut machine = Machine::new(&image).with_print(CollectStringPrint::new());
    machine.execute().expect("runs")
}

fn run_first_global(source: &str) -> String {
    let bytes = build(source).expect("builds");
    let image = Image::load(&bytes).expect("loads");
    let mut machine = Machine::new(&image).with_print(CollectStringPrint::new());
    machine.execute().expect("runs");
    machine.stringify_global(0).expect("program has a global")
}

fn run_output(source: &str) -> String {
    let bytes = build(source).expect("builds");
    let image = Image::load(&bytes).expect("loads");
    let mut machine = Machine::new(&image).with_print(CollectStringPrint::new());
    machine.execute().expect("runs");
    machine.print_writer().output().to_owned()
}

fn run_error(source: &str) -> RuntimeError {
    let bytes = build(source).expect("builds");
    let image = Image::load(&bytes).expect("loads");
    let mut machine = Machine::new(&image).with_print(CollectStringPrint::new());
    machine.execute().expect_err("should fail at runtime").error
}

#[test]
fn arithmetic_expression() {
    assert_eq!(run_exit("dim x = 3 + 4 * 2\nexit x\n"), 11);
}

#[test]
fn string_concat_global() {
    assert_eq!(
        run_first_global("dim s = \"a\" & \"b\" & 1\nexit 0\n"),
        "ab1"
    );
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        run_exit("dim i = 0\nfor k = 1 to 5\n i = i + k\nnext\nexit i\n"),
        15
    );
}

#[test]
fn if_elseif_else_takes_the_first_true_branch() {
    assert_eq!(
        run_exit(
            "dim n = 10\n\
             dim a\n\
             if n > 5\n\
             a = 1\n\
             elseif n > 0\n\
             a = 2\n\
             else\n\
             a = 3\n\
             end if\n\
             exit a\n"
        ),
        1
    );
    assert_eq!(
        run_exit(
            "dim n = 3\n\
             dim a\n\
             if n > 5\n\
             a = 1\n\
             elseif n > 0\n\
             a = 2\n\
             else\n\
             a = 3\n\
             end if\n\
             exit a\n"
        ),
        2
    );
    assert_eq!(
        run_exit(
            "dim n = 0 - 1\n\
             dim a\n\
             if n > 5\n\
             a = 1\n\
             elseif n > 0\n\
             a = 2\n\
             else\n\
             a = 3\n\
             end if\n\
             exit a\n"
        ),
        3
    );
}

#[test]
fn recursive_factorial() {
    assert_eq!(
        run_exit(
            "func f(x)\n\
             if x <= 1\n\
             return 1\n\
             end if\n\
             return x * f(x - 1)\n\
             end func\n\
             dim r = f(5)\n\
             exit r\n"
        ),
        120
    );
}

#[test]
fn dim_redim_and_element_assignment() {
    assert_eq!(
        run_exit(
            "dim a\n\
             dim a[10]\n\
             redim a[4]\n\
             a[0] = 7\n\
             a[1] = a[0] + 1\n\
             exit a[1]\n"
        ),
        8
    );
}

#[test]
fn break_leaves_the_loop_early() {
    assert_eq!(
        run_exit(
            "dim i = 0\n\
             while i < 3\n\
             if i = 2\n\
             break\n\
             end if\n\
             i = i + 1\n\
             end while\n\
             exit i\n"
        ),
        2
    );
}

#[test]
fn continue_skips_to_the_increase_step() {
    assert_eq!(
        run_exit(
            "dim total = 0\n\
             for i = 1 to 10\n\
             if i % 2 = 0\n\
             continue\n\
             end if\n\
             total = total + i\n\
             next\n\
             exit total\n"
        ),
        25
    );
}

#[test]
fn do_while_runs_the_body_at_least_once() {
    assert_eq!(
        run_exit("dim i = 10\ndo\ni = i + 1\nwhile i < 5\nexit i\n"),
        11
    );
    assert_eq!(
        run_exit("dim i = 0\ndo\ni = i + 1\nwhile i < 5\nexit i\n"),
        5
    );
}

#[test]
fn for_loop_with_step() {
    assert_eq!(
        run_exit("dim n = 0\nfor i = 0 to 10 step 2\nn = n + 1\nnext\nexit n\n"),
        6
    );
}

#[test]
fn goto_within_module_scope() {
    assert_eq!(
        run_exit(
            "dim a = 1\n\
             goto past\n\
             a = 99\n\
             past:\n\
             exit a\n"
        ),
        1
    );
}

#[test]
fn goto_within_a_function_scope() {
    assert_eq!(
        run_exit(
            "func f(x)\n\
             if x > 0 goto positive\n\
             return 0\n\
             positive:\n\
             return 1\n\
             end func\n\
             exit f(5)\n"
        ),
        1
    );
}

#[test]
fn operator_truth_table() {
    // (source expression, expected exit value)
    let cases = [
        ("1 + 2 * 3", 7),
        ("(1 + 2) * 3", 9),
        ("2 ^ 3 * 2", 16),
        ("10 \\ 3", 3),
        ("10 % 3", 1),
        ("7 - 2 - 1", 4),
        ("1 & 2 = \"12\"", 1),
        ("3 > 2", 1),
        ("2 > 3", 0),
        ("2 >= 2", 1),
        ("2 <= 1", 0),
        ("1 <> 2", 1),
        ("1 = 1 && 2 = 2", 1),
        ("0 || 1", 1),
        ("!0", 1),
        ("!3", 0),
        ("1 + 2 > 2 && 5 > 4", 1),
        ("0.1 + 0.2 ~= 0.3", 1),
    ];
    for (expression, expected) in cases {
        assert_eq!(
            run_exit(&format!("exit {expression}\n")),
            expected,
            "{expression}"
        );
    }
}

#[test]
fn unary_minus_hands_pow_its_operand() {
    // `-2 ^ 2` binds as 2 ^ (-2); scale up to observe the fraction
    assert_eq!(run_exit("dim a = -2 ^ 2\nexit a * 100\n"), 25);
}

#[test]
fn escape_sequences_survive_to_runtime() {
    assert_eq!(run_output("p(\"a\\tb\\n\")\nexit 0\n"), "a\tb\n");
    assert_eq!(run_output("p(\"\\x41\\x42\")\nexit 0\n"), "AB");
    assert_eq!(run_output("p(\"\\x9\")\nexit 0\n"), "\t");
    assert_eq!(run_output("p(\"quote \\\" and back\\\\\")\nexit 0\n"), "quote \" and back\\");
}

#[test]
fn print_stringifies_numbers_with_trimming() {
    assert_eq!(run_output("p(11.0)\nexit 0\n"), "11");
    assert_eq!(run_output("p(2.5)\nexit 0\n"), "2.5");
    assert_eq!(run_output("p(1 / 3)\nexit 0\n"), "0.3333333333");
}

#[test]
fn arrays_pass_into_functions_by_reference() {
    assert_eq!(
        run_exit(
            "func fill(buf[], n)\n\
             dim i\n\
             for i = 0 to n - 1\n\
             buf[i] = i * i\n\
             next\n\
             return 0\n\
             end func\n\
             dim data[5]\n\
             dim ignore = fill(data, 5)\n\
             exit data[4]\n"
        ),
        16
    );
}

#[test]
fn function_without_explicit_return_yields_zero() {
    assert_eq!(
        run_exit("func noop()\nend func\nexit noop() + 3\n"),
        3
    );
}

#[test]
fn semicolon_separated_statements_run_in_order() {
    assert_eq!(run_exit("dim a = 1; dim b = 2; exit a + b\n"), 3);
}

#[test]
fn string_truthiness_in_conditions() {
    assert_eq!(
        run_exit("dim s = \"\"\nif s\nexit 1\nend if\nexit 2\n"),
        2
    );
    assert_eq!(
        run_exit("dim s = \"x\"\nif s\nexit 1\nend if\nexit 2\n"),
        1
    );
}

#[test]
fn deeply_nested_parens_evaluate() {
    let mut source = String::from("exit ");
    source.push_str(&"(".repeat(100));
    source.push('6');
    source.push_str(&")".repeat(100));
    source.push('\n');
    assert_eq!(run_exit(&source), 6);
}

#[test]
fn nested_loops_with_break_target_the_inner_loop() {
    assert_eq!(
        run_exit(
            "dim count = 0\n\
             for i = 1 to 3\n\
             for j = 1 to 10\n\
             if j = 2\n\
             break\n\
             end if\n\
             count = count + 1\n\
             next j\n\
             next i\n\
             exit count\n"
        ),
        3
    );
}

#[test]
fn runtime_errors_surface_from_the_image() {
    assert_eq!(run_error("dim a = 1 / 0\nexit a\n"), RuntimeError::DivisionByZero);
    assert_eq!(
        run_error("dim a[2]\nexit a[2]\n"),
        RuntimeError::ArrayOutOfBounds
    );
}

#[test]
fn build_errors_carry_lines_and_categories() {
    let BuildError::Syntax(report) = build("while 1\ndim x\nbreak\n").unwrap_err() else {
        panic!("expected a syntax error");
    };
    assert_eq!(report.error, SyntaxError::UnterminatedFuncOrCtrl);

    let BuildError::Semantic(report) =
        build("top:\nfunc f()\ngoto top\nend func\n").unwrap_err()
    else {
        panic!("expected a semantic error");
    };
    assert_eq!(report.error, SemanticError::GotoLabelScopeMismatch);
    assert_eq!(report.line, 3);
}

#[test]
fn end_keyword_mismatch_is_a_parse_error() {
    let BuildError::Syntax(report) = build("if 1\nend while\n").unwrap_err() else {
        panic!("expected a syntax error");
    };
    assert_eq!(report.error, SyntaxError::EndKeywordNotMatch);
}

#[test]
fn string_pool_overflow_is_a_semantic_error() {
    let mut source = String::new();
    for index in 0..40 {
        let chunk = "abcdefgh".repeat(16);
        source.push_str(&format!("dim s{index} = \"{chunk}\"\n"));
    }
    let BuildError::Semantic(report) = build(&source).unwrap_err() else {
        panic!("expected a semantic error");
    };
    assert_eq!(report.error, SemanticError::StrPoolExceed);
}

#[test]
fn exit_without_a_value_is_zero() {
    assert_eq!(run_exit("dim a = 5\nexit\n"), 0);
}

#[test]
fn nil_never_appears_in_normal_flow_but_stringifies() {
    // globals start as Number 0, not nil
    assert_eq!(run_first_global("dim a\nexit 0\n"), "0");
}
