//! Sandboxed expression evaluation for conditional services.
//!
//! Operators author two kinds of snippets: a pre-script of single
//! assignments that binds variables (`n = int(query.get('n', '0'))`) and
//! boolean branch conditions (`n > 10`). Both run against a context built
//! from the request. The language is a small expression dialect evaluated
//! by a tree-walking interpreter; there is no host access, no imports and
//! no attribute reflection, only the builtin allow-list.
//!
//! This is a convenience for trusted operators, not a hardened sandbox:
//! nothing stops an author from writing an expensive expression.

mod interp;
mod lexer;
mod parser;
mod value;

use std::collections::BTreeMap;

use thiserror::Error;

pub use interp::{Env, RESERVED_BINDINGS, eval_expression, run_script};
pub use parser::{Assignment, Expr, parse_expression, parse_script};
pub use value::Value;

use crate::request::InboundRequest;

/// Errors raised while lexing, parsing or evaluating a snippet.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("expected a single assignment like `name = expression`")]
    ExpectedAssignment,
    #[error("cannot assign to reserved name `{0}`")]
    ReservedName(String),
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{0}` is not callable")]
    NotCallable(String),
    #[error("{function} expects {expected} argument(s), got {got}")]
    BadArity {
        function: String,
        expected: &'static str,
        got: usize,
    },
    #[error("type error: {0}")]
    TypeError(String),
    #[error("key `{0}` not found")]
    MissingKey(String),
    #[error("index {0} out of range")]
    IndexOutOfRange(i64),
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0} has no method `{1}`")]
    UnknownMethod(String, String),
}

/// Build the evaluator context for one request.
///
/// Reserved bindings: `request` (a dictionary with `method`, `path`,
/// `query_params`, `headers`, `body`, `url`), the convenience aliases
/// `headers`, `query`, `body`, `method`, `path`, `path_params`, and `json`
/// holding the body parsed as JSON when it parses.
pub fn build_context(request: &InboundRequest, path_params: &BTreeMap<String, String>) -> Env {
    let body_text = request.body_text().into_owned();

    let mut request_map = BTreeMap::new();
    request_map.insert("method".to_string(), Value::Str(request.method.clone()));
    request_map.insert("path".to_string(), Value::Str(request.path.clone()));
    request_map.insert(
        "query_params".to_string(),
        Value::str_map(&request.query_params),
    );
    request_map.insert("headers".to_string(), Value::str_map(&request.headers));
    request_map.insert("body".to_string(), Value::Str(body_text.clone()));
    request_map.insert("url".to_string(), Value::Str(request.url.clone()));

    let mut env = Env::new();
    env.insert("request".to_string(), Value::Map(request_map));
    env.insert("headers".to_string(), Value::str_map(&request.headers));
    env.insert("query".to_string(), Value::str_map(&request.query_params));
    env.insert("body".to_string(), Value::Str(body_text.clone()));
    env.insert("method".to_string(), Value::Str(request.method.clone()));
    env.insert("path".to_string(), Value::Str(request.path.clone()));
    env.insert("path_params".to_string(), Value::str_map(path_params));
    if !body_text.trim().is_empty()
        && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body_text)
    {
        env.insert("json".to_string(), Value::from_json(&parsed));
    }
    env
}

/// Variables bound by the pre-script, stringified for URL substitution.
///
/// Reserved bindings and underscore-prefixed names are skipped.
pub fn user_bindings(env: &Env) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(name, _)| {
            !RESERVED_BINDINGS.contains(&name.as_str()) && !name.starts_with('_')
        })
        .filter(|(_, value)| **value != Value::Null)
        .map(|(name, value)| (name.clone(), value.render()))
        .collect()
}

fn references_name(template: &str, name: &str) -> bool {
    let bytes = template.as_bytes();
    template.match_indices(name).any(|(start, _)| {
        let before_ok = start == 0 || {
            let c = bytes[start - 1] as char;
            !c.is_ascii_alphanumeric() && c != '_'
        };
        let end = start + name.len();
        let after_ok = end >= bytes.len() || {
            let c = bytes[end] as char;
            !c.is_ascii_alphanumeric() && c != '_'
        };
        before_ok && after_ok
    })
}

const EXPRESSION_MARKERS: [&str; 7] = [" + ", " - ", " * ", " / ", "str(", "int(", "float("];

/// Expand a static response template against the evaluation context.
///
/// A template is treated as an expression when it references a variable the
/// pre-script bound, or contains an arithmetic or conversion marker.
/// JSON-shaped templates (first and last non-whitespace characters are `{`
/// and `}`) evaluate as a dictionary and re-serialize; anything else
/// evaluates as a value and stringifies. Any failure, lexing included,
/// returns the template untouched.
pub fn expand_template(template: &str, env: &Env) -> String {
    let references_user_var = env
        .keys()
        .filter(|name| !RESERVED_BINDINGS.contains(&name.as_str()))
        .any(|name| references_name(template, name));
    let has_marker = EXPRESSION_MARKERS.iter().any(|m| template.contains(m));
    if !references_user_var && !has_marker {
        return template.to_string();
    }

    let trimmed = template.trim();
    let evaluated = eval_expression(trimmed, env);
    match evaluated {
        Ok(value) => {
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                value.to_json().to_string()
            } else {
                value.render()
            }
        }
        Err(error) => {
            tracing::debug!(%error, "response template did not evaluate, returning it verbatim");
            template.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;

    fn request_with_query(query: &str, body: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", http::HeaderValue::from_static("application/json"));
        InboundRequest::new("GET", "/x", query, &headers, Bytes::from(body.to_string()))
    }

    #[test]
    fn test_context_bindings() {
        let request = request_with_query("n=5&who=me", r#"{"user": {"id": 9}}"#);
        let params = BTreeMap::from([("id".to_string(), "42".to_string())]);
        let env = build_context(&request, &params);

        assert_eq!(eval_expression("method", &env).unwrap(), Value::Str("GET".into()));
        assert_eq!(eval_expression("query.get('n')", &env).unwrap(), Value::Str("5".into()));
        assert_eq!(eval_expression("path_params['id']", &env).unwrap(), Value::Str("42".into()));
        assert_eq!(eval_expression("request['method']", &env).unwrap(), Value::Str("GET".into()));
        assert_eq!(eval_expression("json['user']['id']", &env).unwrap(), Value::Int(9));
        assert_eq!(
            eval_expression("headers.get('content-type')", &env).unwrap(),
            Value::Str("application/json".into())
        );
    }

    #[test]
    fn test_json_binding_absent_for_non_json_body() {
        let request = request_with_query("", "plain text");
        let env = build_context(&request, &BTreeMap::new());
        assert!(matches!(
            eval_expression("json", &env),
            Err(EvalError::UnknownName(_))
        ));
    }

    #[test]
    fn test_user_bindings_exclude_reserved() {
        let request = request_with_query("n=5", "");
        let mut env = build_context(&request, &BTreeMap::new());
        run_script("n = int(query.get('n', '0'))\n_tmp = 1\nflag = n > 1", &mut env).unwrap();
        let bindings = user_bindings(&env);
        assert_eq!(bindings["n"], "5");
        assert_eq!(bindings["flag"], "true");
        assert!(!bindings.contains_key("_tmp"));
        assert!(!bindings.contains_key("query"));
    }

    #[test]
    fn test_template_plain_text_untouched() {
        let request = request_with_query("", "");
        let mut env = build_context(&request, &BTreeMap::new());
        run_script("n = 3", &mut env).unwrap();
        assert_eq!(expand_template("No condition matched", &env), "No condition matched");
        // `n` inside a longer word is not a reference.
        assert_eq!(expand_template("nothing here", &env), "nothing here");
    }

    #[test]
    fn test_template_json_materialization() {
        let request = request_with_query("n=3", "");
        let mut env = build_context(&request, &BTreeMap::new());
        run_script("n = int(query.get('n', '0'))", &mut env).unwrap();
        assert_eq!(expand_template(r#"{"n": n}"#, &env), r#"{"n":3}"#);
        assert_eq!(expand_template(r#"{"double": n * 2}"#, &env), r#"{"double":6}"#);
    }

    #[test]
    fn test_template_value_expression() {
        let request = request_with_query("", "");
        let mut env = build_context(&request, &BTreeMap::new());
        run_script("n = 4", &mut env).unwrap();
        assert_eq!(expand_template("n + 1", &env), "5");
        assert_eq!(expand_template("str(n) + ' items'", &env), "4 items");
    }

    #[test]
    fn test_template_error_returns_original() {
        let request = request_with_query("", "");
        let mut env = build_context(&request, &BTreeMap::new());
        run_script("n = 4", &mut env).unwrap();
        // References `n` so it is treated as an expression, but fails to
        // evaluate; the template comes back verbatim.
        assert_eq!(expand_template("n +", &env), "n +");
        assert_eq!(expand_template(r#"{"x": n, broken"#, &env), r#"{"x": n, broken"#);
    }
}
