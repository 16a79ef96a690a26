//! Interpolation expressions (`${...}`) over variables, node outputs and run input.
//!
//! A config string that is exactly one `${expr}` evaluates to the typed value
//! of `expr`; any other string containing `${...}` renders each expression
//! into the surrounding text. Strings without `${` are literals.
//!
//! Fields that are expressions by nature (`condition`, `while`, `switch`,
//! `items`, script assignments) may also be written bare, without `${}`.

mod eval;
mod lexer;
mod parser;

pub use eval::EvalScope;
pub use parser::{Accessor, BinaryOp, Expr, UnaryOp};

use crate::{ExpressionError, Value};
use std::collections::BTreeMap;

/// Parse a bare expression
pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    parser::parse(src)
}

/// Syntax-check without evaluating. Accepts either a bare expression or a template.
pub fn check_syntax(src: &str) -> Result<(), ExpressionError> {
    if is_template(src) {
        check_template(src)
    } else {
        check_calls(&parse(src)?)
    }
}

/// Syntax-check every `${...}` segment of a template
pub fn check_template(src: &str) -> Result<(), ExpressionError> {
    for part in Template::parse(src)?.parts {
        if let TemplatePart::Expr(expr) = part {
            check_calls(&expr)?;
        }
    }
    Ok(())
}

fn check_calls(expr: &Expr) -> Result<(), ExpressionError> {
    match expr {
        Expr::Call(name, args) => {
            if !eval::FUNCTIONS.contains(&name.as_str()) {
                return Err(ExpressionError::UnknownFunction(name.clone()));
            }
            args.iter().try_for_each(check_calls)
        }
        Expr::Array(items) => items.iter().try_for_each(check_calls),
        Expr::Unary(_, inner) => check_calls(inner),
        Expr::Binary(_, left, right) => {
            check_calls(left)?;
            check_calls(right)
        }
        Expr::Path(_, accessors) => accessors.iter().try_for_each(|accessor| match accessor {
            Accessor::Index(index) => check_calls(index),
            Accessor::Field(_) => Ok(()),
        }),
        Expr::Literal(_) => Ok(()),
    }
}

/// Evaluate a bare expression or template
pub fn evaluate(src: &str, scope: &EvalScope<'_>) -> Result<Value, ExpressionError> {
    if is_template(src) {
        Template::parse(src)?.render(scope)
    } else {
        eval::eval(&parse(src)?, scope)
    }
}

/// Evaluate and reduce to truthiness
pub fn evaluate_bool(src: &str, scope: &EvalScope<'_>) -> Result<bool, ExpressionError> {
    evaluate(src, scope).map(|v| v.is_truthy())
}

/// Resolve `${...}` inside a config value, recursing into arrays and objects.
/// Plain strings are returned unchanged.
pub fn interpolate(value: &Value, scope: &EvalScope<'_>) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) if is_template(s) => Template::parse(s)?.render(scope),
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| interpolate(v, scope).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn is_template(src: &str) -> bool {
    src.contains("${")
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

/// A string split into literal text and `${...}` expressions
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let mut parts = Vec::new();
        let mut rest = src;
        let mut offset = 0;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(TemplatePart::Text(rest[..start].to_string()));
            }
            let body_start = start + 2;
            let end = find_closing_brace(&rest[body_start..]).ok_or(
                ExpressionError::UnterminatedTemplate {
                    pos: offset + start,
                },
            )?;
            let body = &rest[body_start..body_start + end];
            let expr = parser::parse(body).map_err(|e| shift(e, offset + body_start))?;
            parts.push(TemplatePart::Expr(expr));

            let consumed = body_start + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, scope: &EvalScope<'_>) -> Result<Value, ExpressionError> {
        if let [TemplatePart::Expr(expr)] = self.parts.as_slice() {
            return eval::eval(expr, scope);
        }
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Expr(expr) => out.push_str(&eval::eval(expr, scope)?.to_display_string()),
            }
        }
        Ok(Value::String(out))
    }
}

/// Byte offset of the `}` closing an interpolation, skipping quoted strings
fn find_closing_brace(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '}' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn shift(error: ExpressionError, by: usize) -> ExpressionError {
    match error {
        ExpressionError::UnexpectedChar { ch, pos } => ExpressionError::UnexpectedChar { ch, pos: pos + by },
        ExpressionError::UnterminatedString { pos } => ExpressionError::UnterminatedString { pos: pos + by },
        ExpressionError::UnexpectedToken { expected, found, pos } => ExpressionError::UnexpectedToken {
            expected,
            found,
            pos: pos + by,
        },
        other => other,
    }
}
