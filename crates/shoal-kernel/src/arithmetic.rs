//! Arithmetic and boolean expressions for `%(...)`.
//!
//! Expressions are tokenized with logos, converted to postfix with the
//! shunting-yard algorithm, then evaluated on a stack of arbitrary-precision
//! decimals.
//!
//! ```text
//!   "x += 2 * PI"
//!        │ logos
//!        ▼
//!   [x] [+=] [2] [*] [PI]
//!        │ shunting-yard (precedence / associativity table)
//!        ▼
//!   x 2 PI * +=
//!        │ stack evaluation (BigDecimal, writes x back to the variables)
//!        ▼
//!   Value::Decimal(6.28318...)
//! ```
//!
//! | precedence | operators                               | assoc |
//! |-----------:|-----------------------------------------|-------|
//! |          2 | `\|\|`                                  | right |
//! |          4 | `&&`                                    | right |
//! |          5 | `= += -= *= /= %= \|= &= ^= <<= >>=`    | left  |
//! |          7 | `== !=`                                 | left  |
//! |         10 | `< <= > >= << >>`                       | left  |
//! |         15 | `\| & ^`                                | left  |
//! |         20 | `+ -`                                   | left  |
//! |         30 | `* / %`                                 | left  |
//! |         40 | `**`                                    | right |
//!
//! When both operands are non-numeric strings, `+` concatenates and the
//! comparison operators order lexically. Division, power and `SQRT` use the
//! precision and rounding mode of a [`MathContext`].

use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use logos::Logos;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};
use thiserror::Error;

use crate::interpreter::Value;

/// Largest left shift, in bits.
const MAX_SHIFT_BITS: u64 = 1 << 20;

/// Largest number of digits an exact power may produce.
const MAX_EXACT_DIGITS: u64 = 1_000_000;

/// π to 100 decimal places.
const PI: &str = "3.1415926535897932384626433832795028841971693993751058209749445923078164062862089986280348253421170679";

/// Errors from tokenizing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Unknown operator '{op}' at position {position}")]
    UnknownOperator { op: String, position: usize },
    #[error("Unknown operator or function: {token} at position {position}")]
    UnknownToken { token: String, position: usize },
    #[error("Mismatched parentheses")]
    MismatchedParentheses,
    #[error("Missing operator at character position {0}")]
    MissingOperator(usize),
    #[error("Left hand side of operator {op} should be a variable but found {found}")]
    NotAVariable { op: String, found: String },
    #[error("Argument to SQRT() function must not be negative")]
    NegativeSqrt,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("Non terminated string literal at position {0}")]
    UnterminatedString(usize),
    #[error("{function}() expects {expected} parameter(s)")]
    Arity { function: &'static str, expected: usize },
    #[error("Invalid expression: {0}")]
    Invalid(String),
}

/// Precision and rounding for division, power and square root.
///
/// A precision of 0 means unlimited (division then falls back to the
/// library's default precision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathContext {
    pub precision: u64,
    pub rounding: RoundingMode,
}

impl MathContext {
    pub const DECIMAL32: MathContext = MathContext {
        precision: 7,
        rounding: RoundingMode::HalfEven,
    };
    pub const DECIMAL64: MathContext = MathContext {
        precision: 16,
        rounding: RoundingMode::HalfEven,
    };
    pub const DECIMAL128: MathContext = MathContext {
        precision: 34,
        rounding: RoundingMode::HalfEven,
    };

    pub fn new(precision: u64, rounding: RoundingMode) -> Self {
        Self { precision, rounding }
    }

    /// Round `value` to this context's number of significant digits.
    pub fn round(&self, value: BigDecimal) -> BigDecimal {
        if self.precision == 0 {
            return value;
        }
        let digits = value.digits();
        if digits <= self.precision {
            return value;
        }
        let (_, scale) = value.as_bigint_and_exponent();
        let excess = (digits - self.precision) as i64;
        value.with_scale_round(scale - excess, self.rounding)
    }
}

impl Default for MathContext {
    fn default() -> Self {
        MathContext::DECIMAL128
    }
}

/// Variable storage seen by an expression.
pub trait Variables {
    fn lookup(&self, name: &str) -> Option<Value>;
    fn assign(&mut self, name: &str, value: Value);
}

impl Variables for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }

    fn assign(&mut self, name: &str, value: Value) {
        if value.is_null() {
            self.remove(name);
        } else {
            self.insert(name.to_string(), value);
        }
    }
}

/// Parse and evaluate `source` in one step.
pub fn evaluate(source: &str, vars: &mut dyn Variables, mc: MathContext) -> Result<Value, ExpressionError> {
    Expression::parse(source)?.eval(vars, mc)
}

/// Whether `text` reads as a plain decimal number (digits, sign, point).
pub fn is_number(text: &str) -> bool {
    text != "-"
        && !text.is_empty()
        && text.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '.')
        && BigDecimal::from_str(text).is_ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// Operator and function tables
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,
    OrAssign,
    AndAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,
    Shl,
    Shr,
    BitOr,
    BitAnd,
    BitXor,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    And,
    Or,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

const OPERATORS: &[(&str, Op, u8, bool)] = &[
    ("=", Op::Assign, 5, true),
    ("+=", Op::AddAssign, 5, true),
    ("-=", Op::SubAssign, 5, true),
    ("*=", Op::MulAssign, 5, true),
    ("/=", Op::DivAssign, 5, true),
    ("%=", Op::RemAssign, 5, true),
    ("|=", Op::OrAssign, 5, true),
    ("&=", Op::AndAssign, 5, true),
    ("^=", Op::XorAssign, 5, true),
    ("<<=", Op::ShlAssign, 5, true),
    (">>=", Op::ShrAssign, 5, true),
    ("<<", Op::Shl, 10, true),
    (">>", Op::Shr, 10, true),
    ("|", Op::BitOr, 15, true),
    ("&", Op::BitAnd, 15, true),
    ("^", Op::BitXor, 15, true),
    ("+", Op::Add, 20, true),
    ("-", Op::Sub, 20, true),
    ("*", Op::Mul, 30, true),
    ("/", Op::Div, 30, true),
    ("%", Op::Rem, 30, true),
    ("**", Op::Pow, 40, false),
    ("&&", Op::And, 4, false),
    ("||", Op::Or, 2, false),
    (">", Op::Gt, 10, true),
    (">=", Op::Ge, 10, true),
    ("<", Op::Lt, 10, true),
    ("<=", Op::Le, 10, true),
    ("==", Op::Eq, 7, true),
    ("!=", Op::Ne, 7, true),
];

#[derive(Debug, Clone, Copy)]
struct OpDef {
    text: &'static str,
    op: Op,
    precedence: u8,
    left_assoc: bool,
}

fn lookup_operator(text: &str) -> Option<OpDef> {
    OPERATORS
        .iter()
        .find(|(t, ..)| *t == text)
        .map(|&(text, op, precedence, left_assoc)| OpDef {
            text,
            op,
            precedence,
            left_assoc,
        })
}

impl Op {
    /// The arithmetic operator a compound assignment applies.
    fn compound(self) -> Option<Op> {
        Some(match self {
            Op::AddAssign => Op::Add,
            Op::SubAssign => Op::Sub,
            Op::MulAssign => Op::Mul,
            Op::DivAssign => Op::Div,
            Op::RemAssign => Op::Rem,
            Op::OrAssign => Op::BitOr,
            Op::AndAssign => Op::BitAnd,
            Op::XorAssign => Op::BitXor,
            Op::ShlAssign => Op::Shl,
            Op::ShrAssign => Op::Shr,
            _ => return None,
        })
    }

    fn is_assignment(self) -> bool {
        self == Op::Assign || self.compound().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Not,
    If,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Rad,
    Deg,
    Max,
    Min,
    Abs,
    Log,
    Round,
    Floor,
    Ceiling,
    Sqrt,
}

const FUNCTIONS: &[(&str, Func, usize)] = &[
    ("NOT", Func::Not, 1),
    ("IF", Func::If, 3),
    ("SIN", Func::Sin, 1),
    ("COS", Func::Cos, 1),
    ("TAN", Func::Tan, 1),
    ("SINH", Func::Sinh, 1),
    ("COSH", Func::Cosh, 1),
    ("TANH", Func::Tanh, 1),
    ("RAD", Func::Rad, 1),
    ("DEG", Func::Deg, 1),
    ("MAX", Func::Max, 2),
    ("MIN", Func::Min, 2),
    ("ABS", Func::Abs, 1),
    ("LOG", Func::Log, 1),
    ("ROUND", Func::Round, 2),
    ("FLOOR", Func::Floor, 1),
    ("CEILING", Func::Ceiling, 1),
    ("SQRT", Func::Sqrt, 1),
];

#[derive(Debug, Clone, Copy)]
struct FuncDef {
    name: &'static str,
    func: Func,
    arity: usize,
}

fn lookup_function(name: &str) -> Option<FuncDef> {
    let upper = name.to_ascii_uppercase();
    FUNCTIONS
        .iter()
        .find(|(n, ..)| *n == upper)
        .map(|&(name, func, arity)| FuncDef { name, func, arity })
}

// ═══════════════════════════════════════════════════════════════════════════
// Tokenizer
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
enum Lexeme {
    #[regex(r"[0-9.][0-9.]*")]
    Number,

    #[regex(r"[A-Za-z][A-Za-z0-9_]*")]
    Word,

    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,

    #[token("(")]
    Open,

    #[token(")")]
    Close,

    #[token(",")]
    Comma,

    /// Operator characters; a run never continues past a `-`.
    #[regex(r#"[^A-Za-z0-9_ \t\r\n(),"\-.]+"#)]
    Operator,

    #[regex(r#"-[^A-Za-z0-9_ \t\r\n(),"\-.]*"#)]
    MinusOperator,
}

#[derive(Debug, Clone)]
enum Token {
    Number(BigDecimal),
    Str(String),
    Word(String),
    Open,
    Close,
    Comma,
    Operator(OpDef),
}

#[derive(Debug, Clone)]
struct Positioned {
    token: Token,
    /// 1-based character position of the token start.
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Positioned>, ExpressionError> {
    let mut lexer = Lexeme::lexer(source);
    let mut tokens: Vec<Positioned> = Vec::new();
    let mut last_end: Option<usize> = None;

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let slice = lexer.slice();
        let position = source[..span.start].chars().count() + 1;
        let lexeme = match result {
            Ok(lexeme) => lexeme,
            Err(()) => {
                if slice.starts_with('"') {
                    return Err(ExpressionError::UnterminatedString(position));
                }
                return Err(ExpressionError::UnknownOperator {
                    op: slice.to_string(),
                    position,
                });
            }
        };

        let token = match lexeme {
            Lexeme::Number => {
                let negate = slice_is_unary_minus(&tokens, last_end, span.start);
                if negate {
                    tokens.pop();
                }
                let text = if negate { format!("-{slice}") } else { slice.to_string() };
                let value = BigDecimal::from_str(&text).map_err(|_| ExpressionError::NotANumber(text.clone()))?;
                let position = if negate { position - 1 } else { position };
                last_end = Some(span.end);
                tokens.push(Positioned {
                    token: Token::Number(value),
                    position,
                });
                continue;
            }
            Lexeme::Word => {
                let called = source[span.end..].trim_start().starts_with('(');
                if called && lookup_function(slice).is_none() {
                    return Err(ExpressionError::UnknownToken {
                        token: slice.to_string(),
                        position,
                    });
                }
                Token::Word(slice.to_string())
            }
            Lexeme::Str => Token::Str(unescape(&slice[1..slice.len() - 1])),
            Lexeme::Open => Token::Open,
            Lexeme::Close => Token::Close,
            Lexeme::Comma => Token::Comma,
            Lexeme::Operator | Lexeme::MinusOperator => match lookup_operator(slice) {
                Some(def) => Token::Operator(def),
                None => {
                    return Err(ExpressionError::UnknownOperator {
                        op: slice.to_string(),
                        position,
                    })
                }
            },
        };
        last_end = Some(span.end);
        tokens.push(Positioned { token, position });
    }
    Ok(tokens)
}

/// A `-` directly before a number is a sign when it follows nothing, `(`,
/// `,` or another operator.
fn slice_is_unary_minus(tokens: &[Positioned], last_end: Option<usize>, number_start: usize) -> bool {
    let Some(Positioned {
        token: Token::Operator(def),
        ..
    }) = tokens.last()
    else {
        return false;
    };
    if def.op != Op::Sub || last_end != Some(number_start) {
        return false;
    }
    match tokens.len().checked_sub(2).map(|i| &tokens[i].token) {
        None => true,
        Some(Token::Open) | Some(Token::Comma) | Some(Token::Operator(_)) => true,
        Some(_) => false,
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Shunting-yard
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Rpn {
    Number(BigDecimal),
    Str(String),
    Ident(String),
    Operator(OpDef),
    Function(FuncDef),
}

enum Stacked {
    Operator(OpDef),
    Function(FuncDef),
    Open,
}

/// A parsed expression, ready to be evaluated any number of times.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    rpn: Vec<Rpn>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut output: Vec<Rpn> = Vec::with_capacity(tokens.len());
        let mut stack: Vec<Stacked> = Vec::new();
        let mut previous: Option<&Token> = None;

        for Positioned { token, position } in &tokens {
            match token {
                Token::Number(n) => output.push(Rpn::Number(n.clone())),
                Token::Str(s) => output.push(Rpn::Str(s.clone())),
                Token::Word(w) => match lookup_function(w) {
                    Some(def) => stack.push(Stacked::Function(def)),
                    None => output.push(Rpn::Ident(w.clone())),
                },
                Token::Comma => loop {
                    match stack.last() {
                        Some(Stacked::Open) => break,
                        Some(Stacked::Operator(def)) => {
                            output.push(Rpn::Operator(*def));
                            stack.pop();
                        }
                        Some(Stacked::Function(def)) => {
                            output.push(Rpn::Function(*def));
                            stack.pop();
                        }
                        None => return Err(ExpressionError::MismatchedParentheses),
                    }
                },
                Token::Operator(def) => {
                    while let Some(Stacked::Operator(top)) = stack.last() {
                        let pops = (def.left_assoc && def.precedence <= top.precedence)
                            || def.precedence < top.precedence;
                        if !pops {
                            break;
                        }
                        output.push(Rpn::Operator(*top));
                        stack.pop();
                    }
                    stack.push(Stacked::Operator(*def));
                }
                Token::Open => {
                    if let Some(Token::Number(_)) = previous {
                        return Err(ExpressionError::MissingOperator(*position));
                    }
                    stack.push(Stacked::Open);
                }
                Token::Close => {
                    loop {
                        match stack.pop() {
                            Some(Stacked::Open) => break,
                            Some(Stacked::Operator(def)) => output.push(Rpn::Operator(def)),
                            Some(Stacked::Function(def)) => output.push(Rpn::Function(def)),
                            None => return Err(ExpressionError::MismatchedParentheses),
                        }
                    }
                    if let Some(Stacked::Function(def)) = stack.last() {
                        output.push(Rpn::Function(*def));
                        stack.pop();
                    }
                }
            }
            previous = Some(token);
        }

        while let Some(entry) = stack.pop() {
            match entry {
                Stacked::Open => return Err(ExpressionError::MismatchedParentheses),
                Stacked::Operator(def) => output.push(Rpn::Operator(def)),
                Stacked::Function(def) => output.push(Rpn::Function(def)),
            }
        }

        Ok(Self {
            source: source.to_string(),
            rpn: output,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `vars`; assignments write through to them.
    pub fn eval(&self, vars: &mut dyn Variables, mc: MathContext) -> Result<Value, ExpressionError> {
        let mut stack: Vec<Operand> = Vec::new();
        for item in &self.rpn {
            match item {
                Rpn::Number(n) => stack.push(Operand::Num(n.clone())),
                Rpn::Str(s) => stack.push(Operand::Str(s.clone())),
                Rpn::Ident(name) => stack.push(match constant(name) {
                    Some(value) => Operand::Num(value),
                    None => Operand::Var(name.clone()),
                }),
                Rpn::Operator(def) => {
                    let (Some(v2), Some(v1)) = (stack.pop(), stack.pop()) else {
                        return Err(ExpressionError::Invalid(format!(
                            "missing operand for '{}' in {}",
                            def.text, self.source
                        )));
                    };
                    let result = apply_operator(*def, v1, v2, vars, mc)?;
                    stack.push(result);
                }
                Rpn::Function(def) => {
                    if stack.len() < def.arity {
                        return Err(ExpressionError::Arity {
                            function: def.name,
                            expected: def.arity,
                        });
                    }
                    let params: Vec<Operand> = stack.split_off(stack.len() - def.arity);
                    let params = params
                        .into_iter()
                        .map(|p| resolve(p, &*vars)?.numeric())
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(Operand::Num(apply_function(def.func, &params, mc)?));
                }
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (None, _) => Ok(Value::Null),
            (Some(result), true) => Ok(resolve(result, &*vars)?.into_value()),
            (Some(_), false) => Err(ExpressionError::Invalid(format!("too many operands in {}", self.source))),
        }
    }
}

fn constant(name: &str) -> Option<BigDecimal> {
    match name.to_ascii_uppercase().as_str() {
        "PI" => BigDecimal::from_str(PI).ok(),
        "TRUE" => Some(BigDecimal::one()),
        "FALSE" => Some(BigDecimal::zero()),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Operand {
    Num(BigDecimal),
    Str(String),
    Var(String),
}

impl Operand {
    fn is_numeric(&self) -> bool {
        match self {
            Operand::Num(_) => true,
            Operand::Str(s) => is_number(s),
            Operand::Var(_) => false,
        }
    }

    fn numeric(self) -> Result<BigDecimal, ExpressionError> {
        match self {
            Operand::Num(n) => Ok(n),
            Operand::Str(s) if is_number(&s) => BigDecimal::from_str(&s).map_err(|_| ExpressionError::NotANumber(s)),
            Operand::Str(s) => Err(ExpressionError::NotANumber(s)),
            Operand::Var(name) => Err(ExpressionError::UndefinedVariable(name)),
        }
    }

    fn text(&self) -> String {
        match self {
            Operand::Num(n) => format_decimal(n),
            Operand::Str(s) | Operand::Var(s) => s.clone(),
        }
    }

    fn truthy(self) -> Result<bool, ExpressionError> {
        match self {
            Operand::Str(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Operand::Str(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Ok(!other.numeric()?.is_zero()),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Operand::Num(n) => decimal_to_value(n),
            Operand::Str(s) => Value::String(s),
            Operand::Var(_) => Value::Null,
        }
    }
}

/// Replace a variable reference with the variable's value. Unset variables
/// are an error.
fn resolve(operand: Operand, vars: &dyn Variables) -> Result<Operand, ExpressionError> {
    let Operand::Var(name) = operand else {
        return Ok(operand);
    };
    match vars.lookup(&name) {
        None | Some(Value::Null) => Err(ExpressionError::UndefinedVariable(name)),
        Some(value) => Ok(match value.to_decimal() {
            Some(n) => Operand::Num(n),
            None => Operand::Str(value.to_string()),
        }),
    }
}

/// Integral values become `Int`, everything else a normalized `Decimal`.
pub fn decimal_to_value(n: BigDecimal) -> Value {
    if n.is_integer() {
        if let Some(i) = n.to_i64() {
            return Value::Int(i);
        }
    }
    Value::Decimal(n.normalized())
}

fn format_decimal(n: &BigDecimal) -> String {
    decimal_to_value(n.clone()).to_string()
}

fn bool_operand(b: bool) -> Operand {
    Operand::Num(if b { BigDecimal::one() } else { BigDecimal::zero() })
}

fn apply_operator(
    def: OpDef,
    v1: Operand,
    v2: Operand,
    vars: &mut dyn Variables,
    mc: MathContext,
) -> Result<Operand, ExpressionError> {
    if def.op.is_assignment() {
        let Operand::Var(name) = v1 else {
            return Err(ExpressionError::NotAVariable {
                op: def.text.to_string(),
                found: v1.text(),
            });
        };
        let rhs = resolve(v2, &*vars)?;
        let value = match def.op.compound() {
            None => rhs,
            Some(op) => binary(op, resolve(Operand::Var(name.clone()), &*vars)?, rhs, mc)?,
        };
        vars.assign(&name, value.clone().into_value());
        return Ok(value);
    }
    let v1 = resolve(v1, &*vars)?;
    let v2 = resolve(v2, &*vars)?;
    binary(def.op, v1, v2, mc)
}

fn binary(op: Op, v1: Operand, v2: Operand, mc: MathContext) -> Result<Operand, ExpressionError> {
    if !(v1.is_numeric() && v2.is_numeric()) {
        let ordering = || v1.text().cmp(&v2.text());
        match op {
            Op::Add => return Ok(Operand::Str(v1.text() + &v2.text())),
            Op::Eq => return Ok(bool_operand(ordering().is_eq())),
            Op::Ne => return Ok(bool_operand(ordering().is_ne())),
            Op::Gt => return Ok(bool_operand(ordering().is_gt())),
            Op::Ge => return Ok(bool_operand(ordering().is_ge())),
            Op::Lt => return Ok(bool_operand(ordering().is_lt())),
            Op::Le => return Ok(bool_operand(ordering().is_le())),
            _ => {}
        }
    }

    match op {
        Op::And => return Ok(bool_operand(v1.truthy()? && v2.truthy()?)),
        Op::Or => return Ok(bool_operand(v1.truthy()? || v2.truthy()?)),
        _ => {}
    }

    let a = v1.numeric()?;
    let b = v2.numeric()?;
    let result = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => {
            if b.is_zero() {
                return Err(ExpressionError::DivisionByZero);
            }
            mc.round(a / b)
        }
        Op::Rem => {
            if b.is_zero() {
                return Err(ExpressionError::DivisionByZero);
            }
            a % b
        }
        Op::Pow => power(&a, &b, mc)?,
        Op::Shl | Op::Shr => {
            let n = integer(&a);
            let shift = b.to_i64().ok_or_else(|| ExpressionError::NotANumber(format_decimal(&b)))?;
            let left = (op == Op::Shl) == (shift >= 0);
            let amount = shift.unsigned_abs();
            let shifted = if left {
                if amount > MAX_SHIFT_BITS {
                    return Err(ExpressionError::Invalid(format!("shift count {amount} is too large")));
                }
                n << amount as usize
            } else {
                let amount = amount.min(n.bits() + 1);
                n >> amount as usize
            };
            BigDecimal::new(shifted, 0)
        }
        Op::BitOr => BigDecimal::new(integer(&a) | integer(&b), 0),
        Op::BitAnd => BigDecimal::new(integer(&a) & integer(&b), 0),
        Op::BitXor => BigDecimal::new(integer(&a) ^ integer(&b), 0),
        Op::Gt => return Ok(bool_operand(a > b)),
        Op::Ge => return Ok(bool_operand(a >= b)),
        Op::Lt => return Ok(bool_operand(a < b)),
        Op::Le => return Ok(bool_operand(a <= b)),
        Op::Eq => return Ok(bool_operand(a == b)),
        Op::Ne => return Ok(bool_operand(a != b)),
        _ => return Err(ExpressionError::Invalid(format!("{op:?} is not a binary operator"))),
    };
    Ok(Operand::Num(result))
}

/// Truncate toward zero.
fn integer(n: &BigDecimal) -> BigInt {
    n.with_scale_round(0, RoundingMode::Down).as_bigint_and_exponent().0
}

/// `base ** exp`: exact integer power times a floating fractional power.
fn power(base: &BigDecimal, exp: &BigDecimal, mc: MathContext) -> Result<BigDecimal, ExpressionError> {
    let negative = exp.is_negative();
    let exp = exp.abs();
    let whole = exp.with_scale_round(0, RoundingMode::Down);
    let fraction = &exp - &whole;
    let too_large = || ExpressionError::Invalid(format!("exponent {} is too large", format_decimal(&exp)));
    let whole = whole.to_u32().ok_or_else(too_large)?;
    // Unlimited precision keeps every digit of the result.
    let unit = base.is_zero() || base.abs() == BigDecimal::one();
    if mc.precision == 0 && !unit && base.digits().saturating_mul(u64::from(whole)) > MAX_EXACT_DIGITS {
        return Err(too_large());
    }

    let mut result = BigDecimal::one();
    let mut square = base.clone();
    let mut e = whole;
    while e > 0 {
        if e & 1 == 1 {
            result = mc.round(&result * &square);
        }
        square = mc.round(&square * &square);
        e >>= 1;
    }

    if !fraction.is_zero() {
        let base_f = base.to_f64().unwrap_or(f64::NAN);
        let frac_f = fraction.to_f64().unwrap_or(0.0);
        result = mc.round(result * from_f64(base_f.powf(frac_f))?);
    }

    if negative {
        if result.is_zero() {
            return Err(ExpressionError::DivisionByZero);
        }
        result = mc.round(BigDecimal::one() / result);
    }
    Ok(result)
}

fn from_f64(x: f64) -> Result<BigDecimal, ExpressionError> {
    if !x.is_finite() {
        return Err(ExpressionError::NotANumber(x.to_string()));
    }
    BigDecimal::from_str(&x.to_string())
        .ok()
        .or_else(|| BigDecimal::from_f64(x))
        .ok_or_else(|| ExpressionError::NotANumber(x.to_string()))
}

fn float_fn(x: &BigDecimal, f: impl FnOnce(f64) -> f64) -> Result<BigDecimal, ExpressionError> {
    from_f64(f(x.to_f64().unwrap_or(f64::NAN)))
}

/// Square root by Newton's iteration on a scaled integer.
fn sqrt(x: &BigDecimal, mc: MathContext) -> Result<BigDecimal, ExpressionError> {
    if x.is_zero() {
        return Ok(BigDecimal::zero());
    }
    if x.is_negative() {
        return Err(ExpressionError::NegativeSqrt);
    }
    let precision = if mc.precision == 0 { 34 } else { mc.precision } as i64;
    let n = integer(&(x.clone() * BigDecimal::new(BigInt::one(), -2 * precision)));
    if n.is_zero() {
        return Ok(BigDecimal::zero());
    }
    // Start above the root so the iteration decreases monotonically.
    let mut ix: BigInt = BigInt::one() << ((n.bits() + 1) / 2) as usize;
    loop {
        let next: BigInt = (&ix + &n / &ix) >> 1usize;
        if next >= ix {
            break;
        }
        ix = next;
    }
    Ok(mc.round(BigDecimal::new(ix, precision)))
}

fn apply_function(func: Func, p: &[BigDecimal], mc: MathContext) -> Result<BigDecimal, ExpressionError> {
    let degrees = |x: &BigDecimal| x.to_f64().unwrap_or(f64::NAN).to_radians();
    Ok(match func {
        Func::Not => {
            if p[0].is_zero() {
                BigDecimal::one()
            } else {
                BigDecimal::zero()
            }
        }
        Func::If => {
            if p[0].is_zero() {
                p[2].clone()
            } else {
                p[1].clone()
            }
        }
        Func::Sin => from_f64(degrees(&p[0]).sin())?,
        Func::Cos => from_f64(degrees(&p[0]).cos())?,
        Func::Tan => from_f64(degrees(&p[0]).tan())?,
        Func::Sinh => float_fn(&p[0], f64::sinh)?,
        Func::Cosh => float_fn(&p[0], f64::cosh)?,
        Func::Tanh => float_fn(&p[0], f64::tanh)?,
        Func::Rad => float_fn(&p[0], f64::to_radians)?,
        Func::Deg => float_fn(&p[0], f64::to_degrees)?,
        Func::Max => p[0].clone().max(p[1].clone()),
        Func::Min => p[0].clone().min(p[1].clone()),
        Func::Abs => p[0].abs(),
        Func::Log => float_fn(&p[0], f64::ln)?,
        Func::Round => {
            let places = p[1].to_i64().ok_or_else(|| ExpressionError::NotANumber(format_decimal(&p[1])))?;
            p[0].with_scale_round(places, mc.rounding)
        }
        Func::Floor => p[0].with_scale_round(0, RoundingMode::Floor),
        Func::Ceiling => p[0].with_scale_round(0, RoundingMode::Ceiling),
        Func::Sqrt => sqrt(&p[0], mc)?,
    })
}
