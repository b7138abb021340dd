//! Parser tests using rstest for parameterization.

use rstest::rstest;
use shoal_kernel::ast::{ArrayItems, Executable, Operator, PipeOperator, Program, RedirectKind, Word};
use shoal_kernel::parser::parse;

// ============================================================================
// Helpers
// ============================================================================

fn statement_words(program: &Program, index: usize) -> Vec<String> {
    match &program.items[index].0 {
        Executable::Statement(s) => s.words.iter().map(|w| w.to_string()).collect(),
        Executable::Pipeline(p) => p.stages[0].0.words.iter().map(|w| w.to_string()).collect(),
    }
}

// ============================================================================
// Accepted Programs
// ============================================================================

#[rstest]
#[case::simple("echo hello", 1)]
#[case::sequence("a; b; c", 3)]
#[case::newlines("a\nb\n\nc\n", 3)]
#[case::and_or("a && b || c", 3)]
#[case::pipeline("a | b | c", 1)]
#[case::background("a &", 1)]
#[case::background_then_more("a & b", 2)]
#[case::closure("f = { echo $1 }", 1)]
#[case::nested_closures("f = { g = { h } }", 1)]
#[case::sequence_word("x = (a | b)", 1)]
#[case::substitution("echo $(a; b)", 1)]
#[case::arithmetic("echo %(1 + (2 * 3))", 1)]
#[case::parameter("echo ${x:-default}", 1)]
#[case::array("x = [a b c]", 1)]
#[case::map("x = [a=1 b=2]", 1)]
#[case::comment_only("# nothing here", 0)]
#[case::empty("", 0)]
#[case::quoted_operators("echo 'a | b; c' \"&&\"", 1)]
fn accepted(#[case] source: &str, #[case] executables: usize) {
    let program = parse(source).unwrap_or_else(|e| panic!("{source}: {e}"));
    assert_eq!(program.items.len(), executables, "{source}");
}

#[rstest]
#[case::unclosed_brace("echo {")]
#[case::unclosed_quote("echo 'abc")]
#[case::dangling_and("a &&")]
#[case::dangling_pipe("a |")]
#[case::unclosed_substitution("echo $(ls")]
#[case::unterminated_heredoc("cat <<EOF\nbody\n")]
#[case::unclosed_array("x = [a b")]
fn incomplete_input_is_eof(#[case] source: &str) {
    let err = parse(source).unwrap_err();
    assert!(err.eof, "{source}: {err}");
}

#[rstest]
#[case::leading_pipe("| a")]
#[case::empty_between_operators("a ; ; && b")]
#[case::mismatched_closer("echo a(b}")]
#[case::glued_closure("echo {a}b")]
fn malformed_input_is_rejected(#[case] source: &str) {
    let err = parse(source).unwrap_err();
    assert!(!err.eof, "{source}: {err}");
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn operators_attach_to_the_preceding_executable() {
    let program = parse("a && b || c; d").unwrap();
    let ops: Vec<Option<Operator>> = program.items.iter().map(|(_, op)| *op).collect();
    assert_eq!(
        ops,
        vec![Some(Operator::And), Some(Operator::Or), Some(Operator::Sequence), None]
    );
}

#[test]
fn pipe_all_is_distinguished() {
    let program = parse("a |& b | c").unwrap();
    let Executable::Pipeline(pipeline) = &program.items[0].0 else {
        panic!("expected pipeline");
    };
    let ops: Vec<Option<PipeOperator>> = pipeline.stages.iter().map(|(_, op)| *op).collect();
    assert_eq!(ops, vec![Some(PipeOperator::PipeAll), Some(PipeOperator::Pipe), None]);
    assert!(!pipeline.background);
}

#[test]
fn assignment_splits_on_equals() {
    let program = parse("x=1; y = 2; z=$(a)").unwrap();
    assert_eq!(statement_words(&program, 0), vec!["x", "=", "1"]);
    assert_eq!(statement_words(&program, 1), vec!["y", "=", "2"]);
    assert_eq!(statement_words(&program, 2), vec!["z", "=", "$(a)"]);
}

#[test]
fn words_keep_their_positions() {
    let program = parse("echo a\n  second line").unwrap();
    let Executable::Statement(second) = &program.items[1].0 else {
        panic!("expected statement");
    };
    let token = second.words[0].token();
    assert_eq!((token.line(), token.column()), (2, 3));
}

#[test]
fn closure_bodies_are_programs() {
    let program = parse("f = { a; b | c }").unwrap();
    let Executable::Statement(statement) = &program.items[0].0 else {
        panic!("expected statement");
    };
    let Word::Closure(block) = &statement.words[2] else {
        panic!("expected closure");
    };
    assert_eq!(block.token, "{ a; b | c }");
    assert_eq!(block.program.items.len(), 2);
}

#[test]
fn map_literal_entries() {
    let program = parse("m = [k1=v1 k2 = v2]").unwrap();
    let Executable::Statement(statement) = &program.items[0].0 else {
        panic!("expected statement");
    };
    let Word::Array(array) = &statement.words[2] else {
        panic!("expected array");
    };
    let ArrayItems::Map(entries) = &array.items else {
        panic!("expected map");
    };
    let keys: Vec<String> = entries.iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["k1", "k2"]);
}

#[rstest]
#[case::output("a > f", RedirectKind::Output { fd: 1, both: false, append: false })]
#[case::append("a >> f", RedirectKind::Output { fd: 1, both: false, append: true })]
#[case::stderr("a 2> f", RedirectKind::Output { fd: 2, both: false, append: false })]
#[case::both("a &> f", RedirectKind::Output { fd: 1, both: true, append: false })]
#[case::duplicate("a 2>&1", RedirectKind::Duplicate { fd: 2, target: 1 })]
#[case::input("a < f", RedirectKind::Input { fd: 0, write: false })]
#[case::read_write("a <> f", RedirectKind::Input { fd: 0, write: true })]
#[case::here_string("a <<< word", RedirectKind::HereString)]
fn redirection_kinds(#[case] source: &str, #[case] expected: RedirectKind) {
    let program = parse(source).unwrap();
    let Executable::Statement(statement) = &program.items[0].0 else {
        panic!("expected statement");
    };
    assert_eq!(statement.redirections.len(), 1, "{source}");
    assert_eq!(statement.redirections[0].kind, expected);
    assert_eq!(statement.words.len(), 1);
}

#[test]
fn heredoc_body_is_taken_from_following_lines() {
    let program = parse("cat <<-END\n\tbody\nEND\necho after").unwrap();
    assert_eq!(program.items.len(), 2);
    let Executable::Statement(statement) = &program.items[0].0 else {
        panic!("expected statement");
    };
    assert_eq!(statement.redirections[0].kind, RedirectKind::HereDoc { strip_tabs: true });
    assert_eq!(statement_words(&program, 1), vec!["echo", "after"]);
}
