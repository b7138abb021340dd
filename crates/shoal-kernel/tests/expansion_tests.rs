//! Expansion tests run through a full session: parameter forms, command
//! substitution, arithmetic and argument splicing.

mod common;

use common::{shell, shell_with};
use rstest::rstest;
use shoal_kernel::arithmetic::MathContext;
use shoal_kernel::{SessionConfig, ShellError, Value};

// ============================================================================
// Parameter Forms
// ============================================================================

#[rstest]
#[case::plain("x = shoal; echo $x", "shoal\n")]
#[case::braced_suffix("x = sho; echo ${x}al", "shoal\n")]
#[case::default_when_unset("echo ${missing:-fallback}", "fallback\n")]
#[case::alternate_when_set("x = 1; echo ${x:+set}", "set\n")]
#[case::longest_prefix("p = a/b/c; echo ${p##*/}", "c\n")]
#[case::shortest_suffix("f = x.tar.gz; echo ${f%.*}", "x.tar\n")]
#[case::replace_all("s = 'foo boo'; echo ${s//o/0}", "f00 b00\n")]
#[case::length("s = hello; echo ${#s}", "5\n")]
#[case::index("l = [a b c]; echo ${l[-1]}", "c\n")]
#[case::join_flag("l = [a b c]; echo ${(j:-:)l}", "a-b-c\n")]
#[case::upper_flag("s = quiet; echo ${(U)s}", "QUIET\n")]
#[case::single_quotes("x = v; echo '$x'", "$x\n")]
#[case::double_quotes("x = v; echo \"<$x>\"", "<v>\n")]
#[case::ansi_c("echo $'tab\\there'", "tab\there\n")]
#[tokio::test]
async fn parameter_forms(#[case] script: &str, #[case] expected: &str) {
    let sh = shell();
    sh.run(script).await.unwrap();
    assert_eq!(sh.stdout(), expected);
}

#[tokio::test]
async fn assign_default_writes_the_session() {
    let sh = shell();
    sh.run("echo ${greeting:=hello}; echo ${greeting:=ignored}").await.unwrap();
    assert_eq!(sh.stdout(), "hello\nhello\n");
    assert_eq!(sh.session.get("greeting"), Value::from("hello"));
}

#[tokio::test]
async fn required_parameter_fails_the_statement() {
    let sh = shell();
    let err = sh.run("echo ${needed:?must be given}").await.unwrap_err();
    assert_eq!(err.to_string(), "needed: must be given");
    assert_eq!(sh.stdout(), "");
}

// ============================================================================
// Substitution and Splicing
// ============================================================================

#[tokio::test]
async fn command_substitution_inside_words() {
    let sh = shell();
    sh.run("echo \"[$(echo inner)]\"").await.unwrap();
    assert_eq!(sh.stdout(), "[inner]\n");
}

#[tokio::test]
async fn substitution_sees_session_variables() {
    let sh = shell();
    sh.run("who = world; msg = $(echo hello $who)").await.unwrap();
    assert_eq!(sh.session.get("msg"), Value::from("hello world"));
}

#[tokio::test]
async fn explicit_splice_passes_separate_arguments() {
    let sh = shell();
    sh.run("l = [a b]").await.unwrap();
    assert_eq!(
        sh.run("r = list ${(@)l} end").await.unwrap(),
        Value::List(vec![Value::from("a"), Value::from("b"), Value::from("end")])
    );
    assert_eq!(
        sh.run("r = list $l end").await.unwrap(),
        Value::List(vec![
            Value::List(vec![Value::from("a"), Value::from("b")]),
            Value::from("end"),
        ])
    );
}

#[tokio::test]
async fn split_form_splices_words() {
    let sh = shell();
    sh.run("w = ' one  two '").await.unwrap();
    assert_eq!(
        sh.run("r = list ${=w}").await.unwrap(),
        Value::List(vec![Value::from("one"), Value::from("two")])
    );
}

// ============================================================================
// Arithmetic
// ============================================================================

#[rstest]
#[case::precedence("%(2 + 3 * 4)", Value::Int(14))]
#[case::power("%(2 ** 10)", Value::Int(1024))]
#[case::comparison("%(3 > 2)", Value::Int(1))]
#[case::function("%(MAX(4, 9))", Value::Int(9))]
#[case::bare_variable("n = 20; %(n + 1)", Value::Int(21))]
#[case::dollar_variable("n = 20; %($n / 8)", Value::Decimal("2.5".parse().unwrap()))]
#[tokio::test]
async fn arithmetic_expressions(#[case] script: &str, #[case] expected: Value) {
    let sh = shell();
    assert_eq!(sh.run(script).await.unwrap(), expected);
}

#[tokio::test]
async fn arithmetic_assignment_updates_variables() {
    let sh = shell();
    sh.run("i = 1; %(i += 41)").await.unwrap();
    assert_eq!(sh.session.get("i"), Value::Int(42));
}

#[tokio::test]
async fn division_follows_the_session_math_context() {
    let sh = shell_with(SessionConfig {
        math: MathContext::DECIMAL32,
        ..SessionConfig::default()
    });
    let value = sh.run("%(1 / 3)").await.unwrap();
    assert_eq!(value.to_string(), "0.3333333");
}

#[tokio::test]
async fn expression_errors_surface() {
    let sh = shell();
    let err = sh.run("%(1 / 0)").await.unwrap_err();
    assert!(matches!(err.inner(), ShellError::Expression(_)), "{err:?}");
    assert_eq!(err.to_string(), "Division by zero");
}
