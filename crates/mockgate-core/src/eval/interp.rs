//! Tree-walking interpreter with the builtin allow-list.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::EvalError;
use super::parser::{Assignment, BinaryOp, Expr, UnaryOp, parse_expression, parse_script};
use super::value::Value;

/// Variable bindings an expression evaluates against.
pub type Env = BTreeMap<String, Value>;

/// Names bound by the gateway before the pre-script runs. They are read-only
/// to script authors and never leak into proxy parameter substitution.
pub const RESERVED_BINDINGS: [&str; 8] = [
    "request",
    "headers",
    "query",
    "body",
    "method",
    "path",
    "path_params",
    "json",
];

/// Parse and evaluate one expression against `env`.
pub fn eval_expression(source: &str, env: &Env) -> Result<Value, EvalError> {
    let expr = parse_expression(source)?;
    eval(&expr, env)
}

/// Run a pre-script, binding each assignment into `env`.
///
/// # Errors
///
/// Fails on the first parse or evaluation error; bindings made by earlier
/// lines stay in `env`.
pub fn run_script(source: &str, env: &mut Env) -> Result<(), EvalError> {
    for Assignment { name, expr } in parse_script(source)? {
        if RESERVED_BINDINGS.contains(&name.as_str()) {
            return Err(EvalError::ReservedName(name));
        }
        let value = eval(&expr, env)?;
        env.insert(name, value);
    }
    Ok(())
}

/// Evaluate a parsed expression.
pub fn eval(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownName(name.clone())),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, env)?);
            }
            Ok(Value::List(values))
        }
        Expr::Dict(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let key = match eval(key, env)? {
                    Value::Str(s) => s,
                    other => other.render(),
                };
                map.insert(key, eval(value, env)?);
            }
            Ok(Value::Map(map))
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Int(n) => Ok(Value::Int(-n)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                    other => Err(EvalError::TypeError(format!(
                        "cannot negate {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, env),
        Expr::Index { target, index } => {
            let target = eval(target, env)?;
            let index = eval(index, env)?;
            eval_index(target, index)
        }
        Expr::Member { target, name } => {
            let target = eval(target, env)?;
            match target {
                Value::Map(entries) => entries
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::MissingKey(name.clone())),
                other => Err(EvalError::TypeError(format!(
                    "{} has no member `{name}`",
                    other.type_name()
                ))),
            }
        }
        Expr::Call { function, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, env)?);
            }
            call_builtin(function, values)
        }
        Expr::MethodCall {
            target,
            method,
            args,
        } => {
            let target = eval(target, env)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, env)?);
            }
            call_method(target, method, values)
        }
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, env: &Env) -> Result<Value, EvalError> {
    // Short-circuit logic keeps operand values the way the source dialect
    // does: `a or b` yields `a` when `a` is truthy.
    if op == BinaryOp::And {
        let left = eval(lhs, env)?;
        return if left.truthy() { eval(rhs, env) } else { Ok(left) };
    }
    if op == BinaryOp::Or {
        let left = eval(lhs, env)?;
        return if left.truthy() { Ok(left) } else { eval(rhs, env) };
    }

    let left = eval(lhs, env)?;
    let right = eval(rhs, env)?;
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => arithmetic(left, right, "-", |a, b| a - b),
        BinaryOp::Mul => arithmetic(left, right, "*", |a, b| a * b),
        BinaryOp::Div => divide(left, right),
        BinaryOp::Mod => modulo(left, right),
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(&right))),
        BinaryOp::NotEq => Ok(Value::Bool(!left.loose_eq(&right))),
        BinaryOp::Lt => compare(left, right, "<").map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Gt => compare(left, right, ">").map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::LtEq => compare(left, right, "<=").map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::GtEq => compare(left, right, ">=").map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::In => contains(&right, &left).map(Value::Bool),
        BinaryOp::NotIn => contains(&right, &left).map(|b| Value::Bool(!b)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn add(left: Value, right: Value) -> Result<Value, EvalError> {
    match (&left, &right) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::List(joined))
        }
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        _ => arithmetic(left, right, "+", |a, b| a + b),
    }
}

fn arithmetic(
    left: Value,
    right: Value,
    symbol: &str,
    apply: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        // Integer pairs stay integral for - and *.
        match symbol {
            "-" => return Ok(Value::Int(a - b)),
            "*" => return Ok(Value::Int(a * b)),
            _ => {}
        }
    }
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(Value::Float(apply(a, b))),
        _ => Err(EvalError::TypeError(format!(
            "unsupported operands for `{symbol}`: {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn divide(left: Value, right: Value) -> Result<Value, EvalError> {
    match (left.as_number(), right.as_number()) {
        (Some(_), Some(b)) if b == 0.0 => Err(EvalError::DivisionByZero),
        (Some(a), Some(b)) => Ok(Value::Float(a / b)),
        _ => Err(EvalError::TypeError(format!(
            "unsupported operands for `/`: {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn modulo(left: Value, right: Value) -> Result<Value, EvalError> {
    match (&left, &right) {
        (Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.rem_euclid(*b))),
        _ => match (left.as_number(), right.as_number()) {
            (Some(_), Some(b)) if b == 0.0 => Err(EvalError::DivisionByZero),
            (Some(a), Some(b)) => Ok(Value::Float(a.rem_euclid(b))),
            _ => Err(EvalError::TypeError(format!(
                "unsupported operands for `%`: {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

fn compare(left: Value, right: Value, symbol: &str) -> Result<Ordering, EvalError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::TypeError("cannot order NaN".to_string()));
    }
    if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::TypeError(format!(
        "cannot order {} and {} with `{symbol}`",
        left.type_name(),
        right.type_name()
    )))
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(EvalError::TypeError(format!(
                "`in` on a string needs a string, got {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        Value::Map(entries) => match needle {
            Value::Str(key) => Ok(entries.contains_key(key)),
            other => Err(EvalError::TypeError(format!(
                "`in` on a dict needs a string key, got {}",
                other.type_name()
            ))),
        },
        other => Err(EvalError::TypeError(format!(
            "`in` is not supported on {}",
            other.type_name()
        ))),
    }
}

fn eval_index(target: Value, index: Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::Map(entries), Value::Str(key)) => entries
            .get(&key)
            .cloned()
            .ok_or(EvalError::MissingKey(key)),
        (Value::List(items), Value::Int(raw)) => {
            let index = if raw < 0 { raw + items.len() as i64 } else { raw };
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .ok_or(EvalError::IndexOutOfRange(raw))
        }
        (Value::Str(s), Value::Int(raw)) => {
            let chars: Vec<char> = s.chars().collect();
            let index = if raw < 0 { raw + chars.len() as i64 } else { raw };
            usize::try_from(index)
                .ok()
                .and_then(|i| chars.get(i).copied())
                .map(|c| Value::Str(c.to_string()))
                .ok_or(EvalError::IndexOutOfRange(raw))
        }
        (target, index) => Err(EvalError::TypeError(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn arity(function: &str, expected: &'static str, got: usize) -> EvalError {
    EvalError::BadArity {
        function: function.to_string(),
        expected,
        got,
    }
}

fn int_of(function: &str, value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Float(f) => Ok(*f as i64),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| EvalError::TypeError(format!("{function}: cannot convert '{s}' to int"))),
        other => Err(EvalError::TypeError(format!(
            "{function}: cannot convert {} to int",
            other.type_name()
        ))),
    }
}

fn sortable(items: &[Value]) -> Result<Vec<Value>, EvalError> {
    let mut sorted = items.to_vec();
    let mut failed = None;
    sorted.sort_by(|a, b| match compare(a.clone(), b.clone(), "sorted") {
        Ok(ordering) => ordering,
        Err(e) => {
            failed.get_or_insert(e);
            Ordering::Equal
        }
    });
    match failed {
        Some(e) => Err(e),
        None => Ok(sorted),
    }
}

/// Invoke one of the allow-listed builtins. Anything else is an error, which
/// is the whole point: no host access, no imports, no reflection.
fn call_builtin(function: &str, mut args: Vec<Value>) -> Result<Value, EvalError> {
    match function {
        "int" => match args.len() {
            0 => Ok(Value::Int(0)),
            1 => int_of("int", &args[0]).map(Value::Int),
            n => Err(arity("int", "0 or 1", n)),
        },
        "float" => match args.len() {
            0 => Ok(Value::Float(0.0)),
            1 => match &args[0] {
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    EvalError::TypeError(format!("float: cannot convert '{s}' to float"))
                }),
                other => Err(EvalError::TypeError(format!(
                    "float: cannot convert {} to float",
                    other.type_name()
                ))),
            },
            n => Err(arity("float", "0 or 1", n)),
        },
        "str" => match args.len() {
            0 => Ok(Value::Str(String::new())),
            1 => Ok(Value::Str(args[0].render())),
            n => Err(arity("str", "0 or 1", n)),
        },
        "bool" => match args.len() {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(args[0].truthy())),
            n => Err(arity("bool", "0 or 1", n)),
        },
        "len" => match args.as_slice() {
            [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
            [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
            [Value::Map(entries)] => Ok(Value::Int(entries.len() as i64)),
            [other] => Err(EvalError::TypeError(format!(
                "len: {} has no length",
                other.type_name()
            ))),
            _ => Err(arity("len", "1", args.len())),
        },
        "abs" => match args.as_slice() {
            [Value::Int(n)] => Ok(Value::Int(n.abs())),
            [Value::Float(f)] => Ok(Value::Float(f.abs())),
            [other] => Err(EvalError::TypeError(format!(
                "abs: expected a number, got {}",
                other.type_name()
            ))),
            _ => Err(arity("abs", "1", args.len())),
        },
        "round" => match args.as_slice() {
            [value] => {
                let n = value.as_number().ok_or_else(|| {
                    EvalError::TypeError(format!("round: expected a number, got {}", value.type_name()))
                })?;
                Ok(Value::Int(n.round() as i64))
            }
            [value, digits] => {
                let n = value.as_number().ok_or_else(|| {
                    EvalError::TypeError(format!("round: expected a number, got {}", value.type_name()))
                })?;
                let digits = int_of("round", digits)?;
                let factor = 10f64.powi(digits as i32);
                Ok(Value::Float((n * factor).round() / factor))
            }
            _ => Err(arity("round", "1 or 2", args.len())),
        },
        "max" | "min" => {
            let items: Vec<Value> = match args.len() {
                0 => return Err(arity(function, "at least 1", 0)),
                1 => match args.remove(0) {
                    Value::List(items) => items,
                    single => vec![single],
                },
                _ => args,
            };
            if items.is_empty() {
                return Err(EvalError::TypeError(format!("{function}: empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ordering = compare(item.clone(), best.clone(), function)?;
                let take = if function == "max" {
                    ordering == Ordering::Greater
                } else {
                    ordering == Ordering::Less
                };
                if take {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" => match args.as_slice() {
            [Value::List(items)] => {
                let mut int_total = 0i64;
                let mut float_total = 0f64;
                let mut all_ints = true;
                for item in items {
                    match item {
                        Value::Int(n) => {
                            int_total += n;
                            float_total += *n as f64;
                        }
                        Value::Float(f) => {
                            all_ints = false;
                            float_total += f;
                        }
                        other => {
                            return Err(EvalError::TypeError(format!(
                                "sum: expected numbers, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Ok(if all_ints {
                    Value::Int(int_total)
                } else {
                    Value::Float(float_total)
                })
            }
            [other] => Err(EvalError::TypeError(format!(
                "sum: expected a list, got {}",
                other.type_name()
            ))),
            _ => Err(arity("sum", "1", args.len())),
        },
        "sorted" => match args.as_slice() {
            [Value::List(items)] => sortable(items).map(Value::List),
            [other] => Err(EvalError::TypeError(format!(
                "sorted: expected a list, got {}",
                other.type_name()
            ))),
            _ => Err(arity("sorted", "1", args.len())),
        },
        "reversed" => match args.as_slice() {
            [Value::List(items)] => Ok(Value::List(items.iter().rev().cloned().collect())),
            [Value::Str(s)] => Ok(Value::Str(s.chars().rev().collect())),
            [other] => Err(EvalError::TypeError(format!(
                "reversed: expected a list or string, got {}",
                other.type_name()
            ))),
            _ => Err(arity("reversed", "1", args.len())),
        },
        "enumerate" => match args.as_slice() {
            [Value::List(items)] => Ok(Value::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Value::List(vec![Value::Int(i as i64), item.clone()]))
                    .collect(),
            )),
            [other] => Err(EvalError::TypeError(format!(
                "enumerate: expected a list, got {}",
                other.type_name()
            ))),
            _ => Err(arity("enumerate", "1", args.len())),
        },
        "zip" => {
            let mut lists = Vec::with_capacity(args.len());
            for arg in &args {
                match arg {
                    Value::List(items) => lists.push(items),
                    other => {
                        return Err(EvalError::TypeError(format!(
                            "zip: expected lists, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            let shortest = lists.iter().map(|l| l.len()).min().unwrap_or(0);
            Ok(Value::List(
                (0..shortest)
                    .map(|i| Value::List(lists.iter().map(|l| l[i].clone()).collect()))
                    .collect(),
            ))
        }
        "range" => {
            let (start, stop, step) = match args.len() {
                1 => (0, int_of("range", &args[0])?, 1),
                2 => (int_of("range", &args[0])?, int_of("range", &args[1])?, 1),
                3 => (
                    int_of("range", &args[0])?,
                    int_of("range", &args[1])?,
                    int_of("range", &args[2])?,
                ),
                n => return Err(arity("range", "1 to 3", n)),
            };
            if step == 0 {
                return Err(EvalError::TypeError("range: step must not be zero".to_string()));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(Value::Int(current));
                current += step;
            }
            Ok(Value::List(items))
        }
        "list" | "tuple" => match args.len() {
            0 => Ok(Value::List(Vec::new())),
            1 => match args.remove(0) {
                Value::List(items) => Ok(Value::List(items)),
                Value::Str(s) => Ok(Value::List(
                    s.chars().map(|c| Value::Str(c.to_string())).collect(),
                )),
                Value::Map(entries) => Ok(Value::List(
                    entries.keys().map(|k| Value::Str(k.clone())).collect(),
                )),
                other => Err(EvalError::TypeError(format!(
                    "{function}: cannot convert {} to a list",
                    other.type_name()
                ))),
            },
            n => Err(arity(function, "0 or 1", n)),
        },
        "set" => match args.len() {
            0 => Ok(Value::List(Vec::new())),
            1 => match args.remove(0) {
                Value::List(items) => {
                    let mut unique: Vec<Value> = Vec::new();
                    for item in items {
                        if !unique.iter().any(|u| u.loose_eq(&item)) {
                            unique.push(item);
                        }
                    }
                    Ok(Value::List(unique))
                }
                other => Err(EvalError::TypeError(format!(
                    "set: cannot convert {} to a set",
                    other.type_name()
                ))),
            },
            n => Err(arity("set", "0 or 1", n)),
        },
        "dict" => match args.len() {
            0 => Ok(Value::Map(BTreeMap::new())),
            1 => match args.remove(0) {
                Value::Map(entries) => Ok(Value::Map(entries)),
                Value::List(pairs) => {
                    let mut map = BTreeMap::new();
                    for pair in pairs {
                        match pair {
                            Value::List(kv) if kv.len() == 2 => {
                                let key = match &kv[0] {
                                    Value::Str(s) => s.clone(),
                                    other => other.render(),
                                };
                                map.insert(key, kv[1].clone());
                            }
                            _ => {
                                return Err(EvalError::TypeError(
                                    "dict: expected a list of [key, value] pairs".to_string(),
                                ));
                            }
                        }
                    }
                    Ok(Value::Map(map))
                }
                other => Err(EvalError::TypeError(format!(
                    "dict: cannot convert {} to a dict",
                    other.type_name()
                ))),
            },
            n => Err(arity("dict", "0 or 1", n)),
        },
        "any" | "all" => match args.as_slice() {
            [Value::List(items)] => {
                let result = if function == "any" {
                    items.iter().any(Value::truthy)
                } else {
                    items.iter().all(Value::truthy)
                };
                Ok(Value::Bool(result))
            }
            [other] => Err(EvalError::TypeError(format!(
                "{function}: expected a list, got {}",
                other.type_name()
            ))),
            _ => Err(arity(function, "1", args.len())),
        },
        _ => Err(EvalError::UnknownFunction(function.to_string())),
    }
}

/// Methods allowed on the supplied dictionaries and strings. Deliberately a
/// short list; arbitrary attribute lookup is not available.
fn call_method(target: Value, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match (&target, method) {
        (Value::Map(entries), "get") => match args.as_slice() {
            [Value::Str(key)] => Ok(entries.get(key).cloned().unwrap_or(Value::Null)),
            [Value::Str(key), default] => {
                Ok(entries.get(key).cloned().unwrap_or_else(|| default.clone()))
            }
            _ => Err(arity("get", "1 or 2", args.len())),
        },
        (Value::Map(entries), "keys") => Ok(Value::List(
            entries.keys().map(|k| Value::Str(k.clone())).collect(),
        )),
        (Value::Map(entries), "values") => Ok(Value::List(entries.values().cloned().collect())),
        (Value::Map(entries), "items") => Ok(Value::List(
            entries
                .iter()
                .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
                .collect(),
        )),
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "startswith") => match args.as_slice() {
            [Value::Str(prefix)] => Ok(Value::Bool(s.starts_with(prefix.as_str()))),
            _ => Err(arity("startswith", "1", args.len())),
        },
        (Value::Str(s), "endswith") => match args.as_slice() {
            [Value::Str(suffix)] => Ok(Value::Bool(s.ends_with(suffix.as_str()))),
            _ => Err(arity("endswith", "1", args.len())),
        },
        (Value::Str(s), "split") => match args.as_slice() {
            [] => Ok(Value::List(
                s.split_whitespace()
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
            )),
            [Value::Str(separator)] => Ok(Value::List(
                s.split(separator.as_str())
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
            )),
            _ => Err(arity("split", "0 or 1", args.len())),
        },
        (other, method) => Err(EvalError::UnknownMethod(
            other.type_name().to_string(),
            method.to_string(),
        )),
    }
}
