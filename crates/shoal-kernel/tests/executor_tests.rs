//! Executor tests: statements, assignments, closures, control flow, method
//! calls and error locations, run through a full session.

mod common;

use common::{shell, shell_with};
use rstest::rstest;
use shoal_kernel::interpreter::LOCATION;
use shoal_kernel::{SessionConfig, ShellError, Value};

// ============================================================================
// Statements and Assignment
// ============================================================================

#[tokio::test]
async fn command_output_reaches_stdout() {
    let sh = shell();
    let result = sh.run("echo hello world").await.unwrap();
    assert!(result.is_null());
    assert_eq!(sh.stdout(), "hello world\n");
}

#[tokio::test]
async fn assignment_returns_value_and_sets_variable() {
    let sh = shell();
    let result = sh.run("x = 5").await.unwrap();
    assert_eq!(result, Value::Int(5));
    assert_eq!(sh.session.get("x"), Value::Int(5));
    assert_eq!(sh.run("$x").await.unwrap(), Value::Int(5));
    assert_eq!(sh.stdout(), "", "the last stage of a script prints nothing");
}

#[tokio::test]
async fn assignment_without_value_unsets() {
    let sh = shell();
    sh.run("x = 1").await.unwrap();
    sh.run("x =").await.unwrap();
    assert!(sh.session.get("x").is_null());
}

#[tokio::test]
async fn complex_assignment_runs_the_command() {
    let sh = shell();
    let result = sh.run("l = list a b c").await.unwrap();
    assert_eq!(
        result,
        Value::List(vec![Value::from("a"), Value::from("b"), Value::from("c")])
    );
    assert_eq!(sh.session.get("l"), result);
}

#[tokio::test]
async fn command_substitution_captures_output() {
    let sh = shell();
    sh.run("x = $(echo captured)").await.unwrap();
    assert_eq!(sh.session.get("x"), Value::from("captured"));
    sh.run("y = (list 1 2)").await.unwrap();
    assert_eq!(sh.session.get("y"), Value::List(vec![Value::Int(1), Value::Int(2)]));
    assert_eq!(sh.stdout(), "");
}

#[rstest]
#[case::literal_int("x = 42", Value::Int(42))]
#[case::literal_bool("x = true", Value::Bool(true))]
#[case::literal_null_removes("x = null", Value::Null)]
#[case::quoted_stays_string("x = '42'", Value::from("42"))]
#[case::arithmetic("x = %(6 * 7)", Value::Int(42))]
#[tokio::test]
async fn literal_coercion(#[case] script: &str, #[case] expected: Value) {
    let sh = shell();
    sh.run(script).await.unwrap();
    assert_eq!(sh.session.get("x"), expected);
}

#[tokio::test]
async fn array_and_map_literals() {
    let sh = shell();
    sh.run("l = [a b [c d]]").await.unwrap();
    let Value::List(items) = sh.session.get("l") else { panic!("expected list") };
    assert_eq!(items.len(), 3);

    sh.run("m = [name=shoal size=3]").await.unwrap();
    let Value::Map(map) = sh.session.get("m") else { panic!("expected map") };
    assert_eq!(map.get("name"), Some(&Value::from("shoal")));
    assert_eq!(map.get("size"), Some(&Value::Int(3)));
}

#[tokio::test]
async fn null_command_name_fails() {
    let sh = shell();
    let err = sh.run("$nothing arg").await.unwrap_err();
    assert!(err.to_string().starts_with("Command name evaluates to null"), "{err}");
    assert!(sh.run("$nothing").await.unwrap().is_null());
}

// ============================================================================
// Command Resolution
// ============================================================================

#[tokio::test]
async fn unknown_command_is_reported() {
    let sh = shell();
    let err = sh.run("frobnicate").await.unwrap_err();
    assert!(matches!(err.inner(), ShellError::CommandNotFound(name) if name == "frobnicate"));
    assert_eq!(sh.stderr(), "shoal: CommandNotFoundError: Command not found: frobnicate\n");
}

#[tokio::test]
async fn default_handler_receives_the_name() {
    let sh = shell();
    sh.run("default = { echo \"missing: $1 $2\" }").await.unwrap();
    sh.run("frobnicate now").await.unwrap();
    assert_eq!(sh.stdout(), "missing: frobnicate now\n");
    assert!(sh.session.get(".defaultLock").is_null());
}

#[tokio::test]
async fn diagnostic_prefix_uses_session_name() {
    let sh = shell_with(SessionConfig::named("gosh"));
    sh.run("fail oops").await.unwrap_err();
    assert_eq!(sh.stderr(), "gosh: RuntimeError: oops\n");
}

// ============================================================================
// Closures and Parameters
// ============================================================================

#[tokio::test]
async fn closures_bind_positional_parameters() {
    let sh = shell();
    sh.run("greet = { echo hello $1 }").await.unwrap();
    sh.run("greet world").await.unwrap();
    assert_eq!(sh.stdout(), "hello world\n");
}

#[tokio::test]
async fn closure_result_is_last_value() {
    let sh = shell();
    sh.run("sum = { %($1 + $2) }").await.unwrap();
    assert_eq!(sh.run("r = sum 2 3").await.unwrap(), Value::Int(5));
}

#[tokio::test]
async fn args_splice_and_argv_does_not() {
    let sh = shell();
    sh.run("f = { list $args }").await.unwrap();
    assert_eq!(
        sh.run("r = f a b").await.unwrap(),
        Value::List(vec![Value::from("a"), Value::from("b")])
    );
    sh.run("g = { list $argv }").await.unwrap();
    assert_eq!(
        sh.run("r = g a b").await.unwrap(),
        Value::List(vec![Value::List(vec![Value::from("a"), Value::from("b")])])
    );
    sh.run("h = { $it }").await.unwrap();
    assert_eq!(sh.run("r = h first second").await.unwrap(), Value::from("first"));
}

#[tokio::test]
async fn closure_called_without_arguments_has_none() {
    let sh = shell();
    sh.run("outer = { inner = { echo [$args] }; inner; echo [$args] }").await.unwrap();
    sh.run("outer from-outer").await.unwrap();
    assert_eq!(sh.stdout(), "[]\n[from-outer]\n");
}

#[tokio::test]
async fn closure_does_not_see_script_arguments() {
    let sh = shell();
    sh.session
        .execute_with_args("f = { echo [$args] }; f", vec![Value::from("x")])
        .await
        .unwrap();
    assert_eq!(sh.stdout(), "[]\n");
}

#[tokio::test]
async fn sequences_keep_enclosing_parameters() {
    let sh = shell();
    sh.run("f = { echo $(echo $1) }").await.unwrap();
    sh.run("f seen").await.unwrap();
    assert_eq!(sh.stdout(), "seen\n");
}

#[tokio::test]
async fn spliced_command_word_is_not_an_assignment() {
    let sh = shell();
    let result = sh
        .session
        .execute_with_args("$args = v", vec![Value::from("list"), Value::from("x")])
        .await
        .unwrap();
    assert_eq!(
        result,
        Value::List(vec![Value::from("x"), Value::from("="), Value::from("v")])
    );
}

#[tokio::test]
async fn script_arguments_are_positional() {
    let sh = shell();
    sh.session
        .execute_with_args("echo $1-$2", vec![Value::from("a"), Value::from("b")])
        .await
        .unwrap();
    assert_eq!(sh.stdout(), "a-b\n");
}

// ============================================================================
// Control Flow
// ============================================================================

#[rstest]
#[case::and_runs_on_success("true && echo yes", "yes\n")]
#[case::and_skips_on_failure("false && echo yes", "")]
#[case::or_skips_on_success("true || echo no", "")]
#[case::or_runs_on_failure("false || echo recovered", "recovered\n")]
#[case::sequence_always_runs("false; echo next", "next\n")]
#[case::skipped_item_keeps_chain("false && echo a || echo b", "b\n")]
#[tokio::test]
async fn boolean_operators(#[case] script: &str, #[case] expected: &str) {
    let sh = shell();
    sh.run(script).await.unwrap();
    assert_eq!(sh.stdout(), expected);
}

#[tokio::test]
async fn failures_abort_the_script() {
    let sh = shell();
    let err = sh.run("echo before; fail; echo after").await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(sh.stdout(), "before\n");
}

// ============================================================================
// Methods
// ============================================================================

#[rstest]
#[case::string_method("s = hello; $s toUpperCase", Value::from("HELLO"))]
#[case::get_prefix("s = hello; $s getLength", Value::Int(5))]
#[case::dot_chain("s = hello; $s . toUpperCase . length", Value::Int(5))]
#[case::list_index("l = [a b c]; $l 1", Value::from("b"))]
#[case::list_length("l = [a b c]; $l length", Value::Int(3))]
#[case::map_get("m = [k=v]; $m get k", Value::from("v"))]
#[case::call_closure("f = { %($1 * 2) }; $f execute 21", Value::Int(42))]
#[tokio::test]
async fn method_calls(#[case] script: &str, #[case] expected: Value) {
    let sh = shell();
    assert_eq!(sh.run(script).await.unwrap(), expected);
}

#[tokio::test]
async fn bad_list_index_fails() {
    let sh = shell();
    let err = sh.run("l = [a]; $l 7").await.unwrap_err();
    assert_eq!(err.to_string(), "index out of range: 7");
}

// ============================================================================
// Locations and Tracing
// ============================================================================

#[tokio::test]
async fn errors_carry_their_location() {
    let sh = shell();
    let err = sh
        .session
        .execute_named("echo ok\n  fail", "boot.gosh")
        .await
        .unwrap_err();
    assert_eq!(err.location(), Some("boot.gosh:2.3"));
    assert_eq!(sh.session.get(LOCATION), Value::from("boot.gosh:2.3"));

    sh.run("echo fine").await.unwrap();
    assert!(sh.session.get(LOCATION).is_null(), "reset before each script");
}

#[tokio::test]
async fn innermost_location_wins() {
    let sh = shell();
    sh.run("f = {\n  fail inner\n}").await.unwrap();
    let err = sh.run("f").await.unwrap_err();
    assert_eq!(err.location(), Some("2.3"));
}

#[tokio::test]
async fn echo_variable_traces_statements() {
    let sh = shell();
    sh.run("echo = true").await.unwrap();
    sh.run("echo traced").await.unwrap();
    assert_eq!(sh.stderr(), "+echo traced\n");
    assert_eq!(sh.stdout(), "traced\n");
}
