//! Parser for shoal scripts.
//!
//! Transforms the lexeme stream from [`lexer::tokenize`] into a [`Program`]
//! with chumsky parser combinators.
//!
//! # Grammar
//!
//! ```text
//! program    := (';' | '\n')* (chain (';' | '\n')?)*
//! chain      := pipeline (('&&' | '||') pipeline)*
//! pipeline   := statement (('|' | '|&') statement)* '&'?
//! statement  := (word | redirection)+
//! word       := '{' program '}'                     closure literal
//!             | '(' program ')'                     sequence
//!             | '[' (word* | (word '=' word)*) ']'  list / map literal
//!             | text                                expanded at run time
//! redirection:= [0-9]? ('>' | '>>') word | '&>' word | '&>>' word
//!             | [0-9]? '>&' [0-9]
//!             | [0-9]? ('<' | '<>') word
//!             | ('<<' | '<<-') delimiter            body on following lines
//!             | '<<<' word
//! ```
//!
//! Newlines may follow any operator. A first word of the form `name=value` is
//! split by the lexer into `name`, `=` and `value`, so `x=1` and `x = 1` are
//! the same assignment.

use std::sync::Arc;

use chumsky::{error::RichReason, input::ValueInput, prelude::*};

use crate::ast::{
    ArrayItems, ArrayLiteral, Block, Executable, Operator, PipeOperator, Pipeline, Program,
    Redirection, Statement, Word,
};
use crate::lexer::{self, Lexeme, RedirectOp, Token};

pub use crate::lexer::SyntaxError;

/// Span type used throughout the parser.
pub type Span = SimpleSpan;

type Item = (Executable, Option<Operator>);

/// Parse a whole script.
pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    parse_token(&Token::detached(source))
}

/// Parse the text viewed by `token` as a program, keeping its positions.
pub fn parse_token(token: &Token) -> Result<Program, SyntaxError> {
    let tokens: Vec<(Lexeme, Span)> = lexer::tokenize(token)?
        .into_iter()
        .map(|spanned| (spanned.token, Span::from(spanned.span)))
        .collect();

    let end_span = Span::from(token.len()..token.len());
    let items = program_parser()
        .then_ignore(end())
        .parse(tokens.as_slice().map(end_span, |(t, s)| (t, s)))
        .into_result()
        .map_err(|errors| syntax_error(token, errors))?;

    Ok(Program {
        token: token.clone(),
        items,
    })
}

/// Convert the first chumsky error. Errors at the end of input are flagged
/// `eof` so an interactive caller can ask for more.
fn syntax_error(token: &Token, errors: Vec<Rich<'_, Lexeme, Span>>) -> SyntaxError {
    let Some(error) = errors.into_iter().next() else {
        return SyntaxError::new(token.line(), token.column(), "invalid syntax");
    };
    let at = error.span().start;
    let position = token.slice(at, at);
    let message = match error.reason() {
        RichReason::Custom(message) => message.clone(),
        _ => match error.found() {
            Some(found) => format!("unexpected '{found}'"),
            None => "unexpected EOT".to_string(),
        },
    };
    if at >= token.len() {
        SyntaxError::eof(position.line(), position.column(), message)
    } else {
        SyntaxError::new(position.line(), position.column(), message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Parser Combinators - generic over input type
// ═══════════════════════════════════════════════════════════════════════════

/// One element of a statement.
enum Part {
    Word(Word),
    /// A redirection and the token its text ends with.
    Redirect(Redirection, Token),
}

/// Program body: the items of a script or of a block.
fn program_parser<'tokens, I>() -> impl Parser<'tokens, I, Vec<Item>, extra::Err<Rich<'tokens, Lexeme, Span>>> + Clone
where
    I: ValueInput<'tokens, Token = Lexeme, Span = Span>,
{
    recursive(|items| {
        let newlines = just(Lexeme::Newline).repeated();

        let word = recursive(|word| {
            let text = select! { Lexeme::Word(t) => Word::Text(t) };

            let closure = select! { Lexeme::LBrace(t) => t }
                .then(items.clone())
                .then(select! { Lexeme::RBrace(t) => t })
                .map(|((open, items), close)| Word::Closure(block(open, items, close)));

            let sequence = select! { Lexeme::LParen(t) => t }
                .then(items.clone())
                .then(select! { Lexeme::RParen(t) => t })
                .map(|((open, items), close)| Word::Sequence(block(open, items, close)));

            let element = newlines
                .clone()
                .ignore_then(choice((word, select! { Lexeme::Eq(t) => Word::Text(t) })));
            let array = select! { Lexeme::LBracket(t) => t }
                .then(element.repeated().collect::<Vec<_>>())
                .then_ignore(newlines.clone())
                .then(select! { Lexeme::RBracket(t) => t })
                .try_map(|((open, raw), close), span| {
                    array_literal(open.span_to(&close), raw).map_err(|message| Rich::custom(span, message))
                })
                .map(Word::Array);

            choice((text, closure, sequence, array)).labelled("word").boxed()
        });

        // `N>&M` and heredocs are complete; the rest take the next word.
        let redirect = choice((
            select! { Lexeme::Redirect(r) if !r.needs_target() => r }.map(|r| (r, None)),
            select! { Lexeme::Redirect(r) if r.needs_target() => r }.then(word.clone().map(Some)),
        ))
        .map(|(r, target)| redirection(r, target))
        .labelled("redirection");

        let part = choice((
            redirect,
            word.map(Part::Word),
            select! { Lexeme::Eq(t) => Part::Word(Word::Text(t)) },
        ));
        let statement = part.repeated().at_least(1).collect::<Vec<_>>().map(build_statement);

        let pipe = select! {
            Lexeme::Pipe => PipeOperator::Pipe,
            Lexeme::PipeAll => PipeOperator::PipeAll,
        };
        let pipeline = statement
            .clone()
            .then(pipe.then_ignore(newlines.clone()).then(statement).repeated().collect::<Vec<_>>())
            .then(just(Lexeme::Amp).or_not())
            .map(|((first, rest), amp)| build_pipeline(first, rest, amp.is_some()));

        let and_or = select! {
            Lexeme::And => Operator::And,
            Lexeme::Or => Operator::Or,
        };
        let chain = pipeline
            .clone()
            .then(and_or.then_ignore(newlines.clone()).then(pipeline).repeated().collect::<Vec<_>>())
            .try_map(|(first, rest), span| link(first, rest).map_err(|message| Rich::custom(span, message)));

        let separator = select! { Lexeme::Semi => (), Lexeme::Newline => () }.then_ignore(newlines.clone());
        let list = chain
            .then(separator.or_not())
            .map(|(mut chain, separator)| {
                if let (Some(()), Some(last)) = (separator, chain.last_mut()) {
                    last.1 = Some(Operator::Sequence);
                }
                chain
            })
            .repeated()
            .collect::<Vec<_>>();

        newlines
            .clone()
            .ignore_then(just(Lexeme::Semi).then(newlines).repeated())
            .ignore_then(list)
            .map(|chains| {
                let mut items: Vec<Item> = chains.into_iter().flatten().collect();
                if let Some(last) = items.last_mut() {
                    last.1 = None;
                }
                items
            })
            .boxed()
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Node builders
// ═══════════════════════════════════════════════════════════════════════════

fn block(open: Token, items: Vec<Item>, close: Token) -> Block {
    Block {
        program: Arc::new(Program {
            token: open.span_between(&close),
            items,
        }),
        token: open.span_to(&close),
    }
}

fn redirection(redirect: RedirectOp, target: Option<Word>) -> Part {
    let RedirectOp { op, extent, kind, body } = redirect;
    let end = target.as_ref().map_or(extent, |word| word.token().clone());
    let target = target.or_else(|| body.map(Word::Text));
    tracing::trace!(op = %op, kind = %kind, "parsed redirection");
    Part::Redirect(Redirection { op, kind, target }, end)
}

fn build_statement(parts: Vec<Part>) -> Statement {
    let mut words = Vec::new();
    let mut redirections = Vec::new();
    let mut first: Option<Token> = None;
    let mut last: Option<Token> = None;

    for part in parts {
        match part {
            Part::Word(word) => {
                first.get_or_insert_with(|| word.token().clone());
                last = Some(word.token().clone());
                words.push(word);
            }
            Part::Redirect(redirection, end) => {
                first.get_or_insert_with(|| redirection.op.clone());
                last = Some(end);
                redirections.push(redirection);
            }
        }
    }

    let token = match (first, last) {
        (Some(first), Some(last)) => first.span_to(&last),
        _ => Token::detached(""),
    };
    Statement {
        token,
        words,
        redirections,
    }
}

/// A pipeline with its background flag. A lone foreground statement stays
/// a statement.
fn build_pipeline(first: Statement, rest: Vec<(PipeOperator, Statement)>, background: bool) -> (Executable, bool) {
    if rest.is_empty() && !background {
        return (Executable::Statement(Arc::new(first)), false);
    }

    let mut stages = Vec::with_capacity(rest.len() + 1);
    let mut current = first;
    for (op, next) in rest {
        stages.push((Arc::new(current), Some(op)));
        current = next;
    }
    stages.push((Arc::new(current), None));

    let token = match (stages.first(), stages.last()) {
        (Some((first, _)), Some((last, _))) => first.token.span_to(&last.token),
        _ => Token::detached(""),
    };
    (
        Executable::Pipeline(Pipeline {
            token,
            stages,
            background,
        }),
        background,
    )
}

/// Attach `&&` / `||` to the pipeline before them. A background pipeline
/// is followed by an implicit `;`.
fn link(first: (Executable, bool), rest: Vec<(Operator, (Executable, bool))>) -> Result<Vec<Item>, String> {
    let mut items = Vec::with_capacity(rest.len() + 1);
    let (mut current, mut background) = first;
    for (op, (next, next_background)) in rest {
        if background {
            return Err(format!("unexpected '{op}' after '&'"));
        }
        items.push((current, Some(op)));
        current = next;
        background = next_background;
    }
    items.push((current, background.then_some(Operator::Sequence)));
    Ok(items)
}

/// `[a b c]` is a list, `[k=v ...]` a map and `[=]` the empty map.
fn array_literal(token: Token, raw: Vec<Word>) -> Result<ArrayLiteral, String> {
    let is_eq = |w: &Word| matches!(w, Word::Text(t) if t.as_str() == "=");
    let items = if raw.len() == 1 && is_eq(&raw[0]) {
        ArrayItems::Map(Vec::new())
    } else if raw.len() >= 2 && is_eq(&raw[1]) {
        if raw.len() % 3 != 0 {
            return Err("map literal entries must be key=value".to_string());
        }
        let mut entries = Vec::with_capacity(raw.len() / 3);
        let mut iter = raw.into_iter();
        while let (Some(key), Some(eq), Some(value)) = (iter.next(), iter.next(), iter.next()) {
            if !is_eq(&eq) || is_eq(&key) || is_eq(&value) {
                return Err("map literal entries must be key=value".to_string());
            }
            entries.push((key, value));
        }
        ArrayItems::Map(entries)
    } else {
        if raw.iter().any(is_eq) {
            return Err("unexpected '=' in list literal".to_string());
        }
        ArrayItems::List(raw)
    };
    Ok(ArrayLiteral { token, items })
}
