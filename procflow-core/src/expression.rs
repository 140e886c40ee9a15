//! Expression evaluation
//!
//! The engine only depends on [`ExpressionEvaluator`]. [`ElEvaluator`] is the default
//! adapter: a small `${...}` expression language covering guards, correlation keys and
//! assignment expressions.
//!
//! - Text without `${` evaluates to itself.
//! - A lone `${expr}` evaluates to the typed value of `expr`.
//! - Mixed text interpolates every `${expr}` block into a string.

use chrono::{Local, Utc};
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_until},
    character::complete::{
        alpha1, alphanumeric1, anychar, char, digit1, multispace0, none_of, satisfy,
    },
    combinator::{all_consuming, cut, map, map_opt, not, opt, recognize, rest, value, verify},
    error::{context, convert_error, VerboseError},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::types::VariableMap;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Cannot resolve identifier '{0}'")]
    UnresolvedReference(String),

    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("type error: {0}")]
    Type(String),
}

/// Expression string + variable scope -> typed value.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &VariableMap) -> Result<Value, ExpressionError>;

    /// Guard evaluation. Only booleans (or the strings `true`/`false`) are accepted.
    fn evaluate_bool(&self, expression: &str, scope: &VariableMap) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, scope)? {
            Value::Bool(b) => Ok(b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(ExpressionError::Type(format!(
                "'{expression}' evaluated to {other}, expected a boolean"
            ))),
        }
    }

    /// `null` maps to `None`; non-string values are rendered.
    fn evaluate_string(
        &self,
        expression: &str,
        scope: &VariableMap,
    ) -> Result<Option<String>, ExpressionError> {
        Ok(match self.evaluate(expression, scope)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }
}

/// Default `${...}` evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElEvaluator;

impl ExpressionEvaluator for ElEvaluator {
    fn evaluate(&self, expression: &str, scope: &VariableMap) -> Result<Value, ExpressionError> {
        let segments = split_segments(expression)?;
        match segments.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Segment::Text(text)] => Ok(Value::String(text.clone())),
            [Segment::Expr(src)] => eval_source(src, scope),
            _ => {
                let mut out = String::new();
                for segment in &segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Expr(src) => out.push_str(&render(&eval_source(src, scope)?)),
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// True if the string contains at least one `${...}` block.
pub fn is_expression(raw: &str) -> bool {
    raw.contains("${")
}

// ── Segmenting ──

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, PartialEq)]
enum Segment {
    Text(String),
    Expr(String),
}

fn split_segments(raw: &str) -> Result<Vec<Segment>, ExpressionError> {
    all_consuming(many0(alt((block_segment, text_segment))))(raw)
        .map(|(_, segments)| segments)
        .map_err(|e| syntax_error(raw, e))
}

/// `${ ... }`, skipping braces inside quoted strings.
fn block_segment(input: &str) -> Res<'_, Segment> {
    map(
        preceded(
            tag("${"),
            context(
                "unterminated '${'",
                cut(terminated(
                    recognize(many0(alt((recognize(string_literal), is_not("}'\""))))),
                    char('}'),
                )),
            ),
        ),
        |body: &str| Segment::Expr(body.to_string()),
    )(input)
}

fn text_segment(input: &str) -> Res<'_, Segment> {
    map(
        verify(alt((take_until("${"), rest)), |text: &str| !text.is_empty()),
        |text: &str| Segment::Text(text.to_string()),
    )(input)
}

fn syntax(expression: &str, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        expression: expression.to_string(),
        message: message.into(),
    }
}

fn syntax_error(src: &str, err: nom::Err<VerboseError<&str>>) -> ExpressionError {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => syntax(src, convert_error(src, e).trim_end()),
        nom::Err::Incomplete(_) => syntax(src, "incomplete input"),
    }
}

fn eval_source(src: &str, scope: &VariableMap) -> Result<Value, ExpressionError> {
    let (_, expr) = all_consuming(terminated(conditional, multispace0))(src)
        .map_err(|e| syntax_error(src, e))?;
    eval(&expr, scope)
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── AST ──

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Call(String, Vec<Expr>),
    Method(Box<Expr>, String, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Empty(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

// ── Grammar ──
//
// conditional    := or ('?' conditional ':' conditional)?
// or .. mul      := left-associative binary levels, loosest first
// unary          := ('!' | 'not' | '-' | 'empty') unary | postfix
// postfix        := primary ('.' name arguments?)*
// primary        := number | string | '(' conditional ')' | name arguments?

fn conditional(input: &str) -> Res<'_, Expr> {
    let (input, cond) = or_expr(input)?;
    let (input, branches) = opt(preceded(
        sym('?'),
        cut(pair(conditional, preceded(sym(':'), conditional))),
    ))(input)?;
    Ok((
        input,
        match branches {
            Some((then, otherwise)) => {
                Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
            }
            None => cond,
        },
    ))
}

fn or_expr(input: &str) -> Res<'_, Expr> {
    left_assoc(input, and_expr, alt((value("||", tag("||")), value("||", keyword("or")))))
}

fn and_expr(input: &str) -> Res<'_, Expr> {
    left_assoc(input, equality, alt((value("&&", tag("&&")), value("&&", keyword("and")))))
}

fn equality(input: &str) -> Res<'_, Expr> {
    left_assoc(
        input,
        relational,
        alt((
            value("==", tag("==")),
            value("!=", tag("!=")),
            value("==", keyword("eq")),
            value("!=", keyword("ne")),
        )),
    )
}

fn relational(input: &str) -> Res<'_, Expr> {
    left_assoc(
        input,
        additive,
        alt((
            value("<=", tag("<=")),
            value(">=", tag(">=")),
            value("<", tag("<")),
            value(">", tag(">")),
            value("<=", keyword("le")),
            value(">=", keyword("ge")),
            value("<", keyword("lt")),
            value(">", keyword("gt")),
        )),
    )
}

fn additive(input: &str) -> Res<'_, Expr> {
    left_assoc(input, multiplicative, alt((value("+", tag("+")), value("-", tag("-")))))
}

fn multiplicative(input: &str) -> Res<'_, Expr> {
    left_assoc(
        input,
        unary,
        alt((
            value("*", tag("*")),
            value("/", tag("/")),
            value("%", tag("%")),
            value("/", keyword("div")),
            value("%", keyword("mod")),
        )),
    )
}

fn left_assoc<'a, O>(
    input: &'a str,
    operand: fn(&'a str) -> Res<'a, Expr>,
    operator: O,
) -> Res<'a, Expr>
where
    O: Parser<&'a str, &'static str, VerboseError<&'a str>>,
{
    let (input, first) = operand(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, operator), operand))(input)?;
    let expr = rest.into_iter().fold(first, |lhs, (op, rhs)| {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    });
    Ok((input, expr))
}

fn unary(input: &str) -> Res<'_, Expr> {
    preceded(
        multispace0,
        alt((
            map(preceded(alt((tag("!"), keyword("not"))), unary), |e| {
                Expr::Not(Box::new(e))
            }),
            map(preceded(char('-'), unary), |e| Expr::Neg(Box::new(e))),
            map(preceded(keyword("empty"), unary), |e| Expr::Empty(Box::new(e))),
            postfix,
        )),
    )(input)
}

fn postfix(input: &str) -> Res<'_, Expr> {
    let (input, base) = primary(input)?;
    let (input, accessors) = many0(preceded(
        sym('.'),
        cut(pair(preceded(multispace0, identifier), opt(arguments))),
    ))(input)?;
    let expr = accessors
        .into_iter()
        .fold(base, |target, (name, args)| match args {
            Some(args) => Expr::Method(Box::new(target), name.to_string(), args),
            None => Expr::Member(Box::new(target), name.to_string()),
        });
    Ok((input, expr))
}

fn primary(input: &str) -> Res<'_, Expr> {
    preceded(
        multispace0,
        alt((
            map(number, Expr::Literal),
            map(string_literal, |s| Expr::Literal(Value::String(s))),
            delimited(char('('), conditional, cut(sym(')'))),
            name_or_call,
        )),
    )(input)
}

fn name_or_call(input: &str) -> Res<'_, Expr> {
    let (input, name) = identifier(input)?;
    match name {
        "true" => Ok((input, Expr::Literal(Value::Bool(true)))),
        "false" => Ok((input, Expr::Literal(Value::Bool(false)))),
        "null" => Ok((input, Expr::Literal(Value::Null))),
        _ => {
            let (input, args) = opt(arguments)(input)?;
            let expr = match args {
                Some(args) => Expr::Call(name.to_string(), args),
                None => Expr::Ident(name.to_string()),
            };
            Ok((input, expr))
        }
    }
}

fn arguments(input: &str) -> Res<'_, Vec<Expr>> {
    delimited(
        sym('('),
        separated_list0(sym(','), conditional),
        cut(sym(')')),
    )(input)
}

// ── Tokens ──

fn sym<'a>(c: char) -> impl FnMut(&'a str) -> Res<'a, char> {
    preceded(multispace0, char(c))
}

/// A word operator that is not the prefix of a longer name.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    terminated(
        tag(word),
        not(satisfy(|c: char| c.is_alphanumeric() || c == '_')),
    )
}

fn identifier(input: &str) -> Res<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn number(input: &str) -> Res<'_, Value> {
    map_opt(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |digits: &str| {
            if digits.contains('.') {
                digits
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            } else {
                digits.parse::<i64>().ok().map(Value::from)
            }
        },
    )(input)
}

fn string_literal(input: &str) -> Res<'_, String> {
    alt((quoted('\'', "'\\"), quoted('"', "\"\\")))(input)
}

/// Backslash takes the next character literally.
fn quoted<'a>(quote: char, stop: &'static str) -> impl FnMut(&'a str) -> Res<'a, String> {
    delimited(
        char(quote),
        map(
            opt(escaped_transform(none_of(stop), '\\', anychar)),
            Option::unwrap_or_default,
        ),
        cut(char(quote)),
    )
}

// ── Evaluation ──

fn eval(expr: &Expr, scope: &VariableMap) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnresolvedReference(name.clone())),
        Expr::Member(base, property) => match eval(base, scope)? {
            Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
            other => Err(ExpressionError::Type(format!(
                "cannot read property '{property}' of {other}"
            ))),
        },
        Expr::Method(base, method, args) => {
            let target = eval(base, scope)?;
            match (method.as_str(), args.is_empty()) {
                ("toString", true) => Ok(Value::String(render(&target))),
                _ => Err(ExpressionError::Type(format!(
                    "unsupported method '{method}' with {} argument(s)",
                    args.len()
                ))),
            }
        }
        Expr::Call(function, args) => match (function.as_str(), args.is_empty()) {
            ("today", true) => Ok(Value::String(
                Local::now().date_naive().format("%Y-%m-%d").to_string(),
            )),
            ("current", true) => Ok(Value::String(Utc::now().to_rfc3339())),
            _ => Err(ExpressionError::UnresolvedReference(function.clone())),
        },
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(&eval(inner, scope)?)?)),
        Expr::Neg(inner) => match eval(inner, scope)? {
            Value::Number(n) if n.is_i64() => Ok(Value::from(-n.as_i64().unwrap_or_default())),
            other => float_value(-as_f64(&other)?),
        },
        Expr::Empty(inner) => Ok(Value::Bool(match eval(inner, scope) {
            Ok(Value::Null) | Err(ExpressionError::UnresolvedReference(_)) => true,
            Ok(Value::String(s)) => s.is_empty(),
            Ok(Value::Array(a)) => a.is_empty(),
            Ok(Value::Object(o)) => o.is_empty(),
            Ok(_) => false,
            Err(e) => return Err(e),
        })),
        Expr::Conditional(cond, then, otherwise) => {
            if as_bool(&eval(cond, scope)?)? {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Binary("&&", lhs, rhs) => {
            if !as_bool(&eval(lhs, scope)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, scope)?)?))
        }
        Expr::Binary("||", lhs, rhs) => {
            if as_bool(&eval(lhs, scope)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, scope)?)?))
        }
        Expr::Binary(op, lhs, rhs) => binary(op, eval(lhs, scope)?, eval(rhs, scope)?),
    }
}

fn binary(op: &str, lhs: Value, rhs: Value) -> Result<Value, ExpressionError> {
    match op {
        "==" => Ok(Value::Bool(loosely_equal(&lhs, &rhs))),
        "!=" => Ok(Value::Bool(!loosely_equal(&lhs, &rhs))),
        "<" | ">" | "<=" | ">=" => {
            let ordering = match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => as_f64(&lhs)?
                    .partial_cmp(&as_f64(&rhs)?)
                    .ok_or_else(|| ExpressionError::Type("NaN is not comparable".into()))?,
            };
            Ok(Value::Bool(match op {
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                _ => ordering.is_ge(),
            }))
        }
        _ => arithmetic(op, &lhs, &rhs),
    }
}

fn arithmetic(op: &str, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let checked = match op {
            "+" => a.checked_add(b),
            "-" => a.checked_sub(b),
            "*" => a.checked_mul(b),
            "%" if b != 0 => a.checked_rem(b),
            _ => None,
        };
        if let Some(n) = checked {
            return Ok(Value::from(n));
        }
    }
    let (a, b) = (as_f64(lhs)?, as_f64(rhs)?);
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" if b == 0.0 => return Err(ExpressionError::Type("division by zero".into())),
        "/" => a / b,
        "%" if b == 0.0 => return Err(ExpressionError::Type("division by zero".into())),
        "%" => a % b,
        other => return Err(ExpressionError::Type(format!("unknown operator '{other}'"))),
    };
    float_value(result)
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => lhs.as_f64() == rhs.as_f64(),
        _ => lhs == rhs,
    }
}

fn as_bool(value: &Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ExpressionError::Type(format!("{other} is not a boolean"))),
    }
}

fn as_f64(value: &Value) -> Result<f64, ExpressionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExpressionError::Type(format!("{n} is not representable"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ExpressionError::Type(format!("'{s}' is not a number"))),
        other => Err(ExpressionError::Type(format!("{other} is not a number"))),
    }
}

fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("{f} is not a finite number")))
}
