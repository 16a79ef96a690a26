use super::parser::{Accessor, BinaryOp, Expr, UnaryOp};
use crate::{ExpressionError, Value};
use std::collections::BTreeMap;

/// Bindings an expression is evaluated against.
///
/// Roots: `input`, `vars`/`variables`, `nodes`, plus any locals (`item`,
/// `index`, `loop`). A bare identifier falls back to locals, then variables.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub variables: &'a BTreeMap<String, Value>,
    pub nodes: &'a BTreeMap<String, Value>,
    pub input: &'a Value,
    pub locals: Option<&'a BTreeMap<String, Value>>,
}

static EMPTY: BTreeMap<String, Value> = BTreeMap::new();
static NULL: Value = Value::Null;

impl<'a> EvalScope<'a> {
    pub fn new(
        variables: &'a BTreeMap<String, Value>,
        nodes: &'a BTreeMap<String, Value>,
        input: &'a Value,
    ) -> Self {
        Self {
            variables,
            nodes,
            input,
            locals: None,
        }
    }

    /// Scope with nothing bound; useful for constant expressions
    pub fn empty() -> EvalScope<'static> {
        EvalScope {
            variables: &EMPTY,
            nodes: &EMPTY,
            input: &NULL,
            locals: None,
        }
    }

    pub fn with_locals(mut self, locals: &'a BTreeMap<String, Value>) -> Self {
        self.locals = Some(locals);
        self
    }
}

enum Root<'a> {
    Map(&'a BTreeMap<String, Value>),
    Value(&'a Value),
}

pub fn eval(expr: &Expr, scope: &EvalScope<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Path(root, accessors) => resolve_path(root, accessors, scope),
        Expr::Unary(op, inner) => {
            let value = eval(inner, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => match value {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(type_error("negate", &other)),
                },
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            if !eval(left, scope)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(right, scope)?.is_truthy()))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if eval(left, scope)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(right, scope)?.is_truthy()))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            binary(*op, left, right)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
    }
}

fn resolve_path(
    root: &str,
    accessors: &[Accessor],
    scope: &EvalScope<'_>,
) -> Result<Value, ExpressionError> {
    let root = match root {
        "input" => Root::Value(scope.input),
        "vars" | "variables" => Root::Map(scope.variables),
        "nodes" => Root::Map(scope.nodes),
        name => {
            let local = scope.locals.and_then(|locals| locals.get(name));
            match local.or_else(|| scope.variables.get(name)) {
                Some(value) => Root::Value(value),
                None => return Ok(Value::Null),
            }
        }
    };

    let mut accessors = accessors.iter();
    let mut current: &Value = match root {
        Root::Value(value) => value,
        Root::Map(map) => match accessors.next() {
            None => return Ok(Value::Object(map.clone())),
            Some(accessor) => {
                let key = match accessor {
                    Accessor::Field(field) => field.clone(),
                    Accessor::Index(index) => eval(index, scope)?.to_display_string(),
                };
                match map.get(&key) {
                    Some(value) => value,
                    None => return Ok(Value::Null),
                }
            }
        },
    };

    for accessor in accessors {
        let next = match accessor {
            Accessor::Field(field) => current.get(field),
            Accessor::Index(index) => match eval(index, scope)? {
                Value::Number(n) if n >= 0.0 => current.index(n as usize),
                Value::String(key) => current.get(&key),
                _ => None,
            },
        };
        match next {
            Some(value) => current = value,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(ExpressionError::Type(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (a @ Value::String(_), b) | (a, b @ Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                a.to_display_string(),
                b.to_display_string()
            ))),
            (a, b) => Err(ExpressionError::Type(format!(
                "cannot add {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (Value::Number(a), Value::Number(b)) = (&left, &right) else {
                return Err(ExpressionError::Type(format!(
                    "arithmetic on {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            let (a, b) = (*a, *b);
            match op {
                BinaryOp::Sub => Ok(Value::Number(a - b)),
                BinaryOp::Mul => Ok(Value::Number(a * b)),
                _ if b == 0.0 => Err(ExpressionError::DivisionByZero),
                BinaryOp::Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
        // eval short-circuits these before both sides are computed
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExpressionError::Type(format!(
                "{}() takes {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };
    match name {
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                Value::Null => Ok(Value::Number(0.0)),
                other => Err(type_error("take len of", other)),
            }
        }
        "lower" | "upper" => {
            arity(1)?;
            let s = args[0].to_display_string();
            Ok(Value::String(if name == "lower" {
                s.to_lowercase()
            } else {
                s.to_uppercase()
            }))
        }
        "contains" => {
            arity(2)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(hay), needle) => hay.contains(&needle.to_display_string()),
                (Value::Array(items), needle) => items.contains(needle),
                (Value::Object(map), needle) => map.contains_key(&needle.to_display_string()),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "default" => {
            arity(2)?;
            let mut args = args.into_iter();
            let value = args.next().unwrap_or_default();
            let fallback = args.next().unwrap_or_default();
            Ok(if value.is_null() { fallback } else { value })
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

/// Names accepted by `call`; the syntax checker uses this to flag typos early
pub(crate) const FUNCTIONS: &[&str] = &["len", "lower", "upper", "contains", "default"];

fn type_error(action: &str, value: &Value) -> ExpressionError {
    ExpressionError::Type(format!("cannot {} {}", action, value.type_name()))
}
