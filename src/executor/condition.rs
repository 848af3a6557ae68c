//! Condition evaluation for `when`, `failed_when`, `changed_when`, and
//! `until` clauses, plus loop-item materialization.
//!
//! Pure, no I/O. A condition is a bool, an expression string, or a sequence
//! of conditions (logical AND). The string grammar is deliberately small:
//! `not` / `and` / `or`, membership (`in`, `not in`), defined-ness
//! (`is defined`, `is undefined`), comparisons, literals, and dotted
//! variable paths with `[idx]` sequence indexing. Splitting happens on the
//! first occurrence of the lowest-precedence operator at the current level,
//! so `a or b and c` parses as `a or (b and c)` and `not a and b` as
//! `(not a) and b`. Parenthesized boolean grouping is not part of the
//! grammar and is rejected rather than guessed.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::playbook::TaskResult;
use crate::vars::VarMap;

/// Errors from condition parsing or evaluation.
#[derive(Debug, Error)]
pub enum ConditionError {
    /// The expression does not fit the grammar.
    #[error("Cannot parse condition '{0}'")]
    Parse(String),

    /// A loop expression did not materialize into a sequence.
    #[error("Invalid loop expression: {0}")]
    InvalidLoop(String),
}

/// Result type for condition operations.
pub type ConditionResult<T> = Result<T, ConditionError>;

/// A condition attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Boolean literal
    Bool(bool),
    /// Expression string
    Expr(String),
    /// Sequence of conditions, all of which must hold
    All(Vec<Condition>),
}

impl From<bool> for Condition {
    fn from(b: bool) -> Self {
        Condition::Bool(b)
    }
}

impl From<&str> for Condition {
    fn from(s: &str) -> Self {
        Condition::Expr(s.to_string())
    }
}

impl From<String> for Condition {
    fn from(s: String) -> Self {
        Condition::Expr(s)
    }
}

/// Evaluates conditions against a variable view.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator<'a> {
    vars: &'a VarMap,
}

impl<'a> ConditionEvaluator<'a> {
    /// Create an evaluator over `vars`.
    pub fn new(vars: &'a VarMap) -> Self {
        Self { vars }
    }

    /// Evaluate a condition value.
    pub fn evaluate(&self, condition: &Condition) -> ConditionResult<bool> {
        match condition {
            Condition::Bool(b) => Ok(*b),
            Condition::Expr(expr) => self.evaluate_expression(expr),
            Condition::All(conds) => {
                for cond in conds {
                    if !self.evaluate(cond)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Evaluate a string expression.
    pub fn evaluate_expression(&self, expr: &str) -> ConditionResult<bool> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(true);
        }
        if contains_unquoted(expr, &['(', ')']) {
            return Err(ConditionError::Parse(format!(
                "parenthesized grouping is not supported: '{}'",
                expr
            )));
        }

        // Boolean operators bind loosest; `or` looser than `and`.
        if let Some((left, right)) = split_top_level(expr, "or") {
            return Ok(self.evaluate_expression(left)? || self.evaluate_expression(right)?);
        }
        if let Some((left, right)) = split_top_level(expr, "and") {
            return Ok(self.evaluate_expression(left)? && self.evaluate_expression(right)?);
        }
        if let Some(inner) = expr.strip_prefix("not ") {
            return Ok(!self.evaluate_expression(inner)?);
        }

        // Membership, longest operator first.
        if let Some((left, right)) = split_once_unquoted(expr, " not in ") {
            return Ok(!self.membership(left.trim(), right.trim()));
        }
        if let Some((left, right)) = split_once_unquoted(expr, " in ") {
            return Ok(self.membership(left.trim(), right.trim()));
        }

        // Defined-ness.
        if let Some(path) = expr.strip_suffix(" is defined") {
            return Ok(self.resolve_path(path.trim()).is_some());
        }
        if let Some(path) = expr.strip_suffix(" is undefined") {
            return Ok(self.resolve_path(path.trim()).is_none());
        }

        // Comparisons, longest operator first.
        for op in ["==", "!=", ">=", "<=", ">", "<"] {
            if let Some((left, right)) = split_once_unquoted(expr, op) {
                let lhs = self.resolve_operand(left.trim());
                let rhs = self.resolve_operand(right.trim());
                return Ok(compare(op, &lhs, &rhs));
            }
        }

        // A lone literal or variable path.
        Ok(is_truthy(&self.resolve_operand(expr)))
    }

    fn membership(&self, needle: &str, haystack: &str) -> bool {
        let needle = self.resolve_operand(needle);
        match self.resolve_operand(haystack) {
            JsonValue::Array(items) => items.iter().any(|i| values_equal(i, &needle)),
            JsonValue::String(s) => match &needle {
                JsonValue::String(n) => s.contains(n.as_str()),
                other => s.contains(&scalar_to_string(other)),
            },
            JsonValue::Object(map) => match &needle {
                JsonValue::String(n) => map.contains_key(n),
                _ => false,
            },
            _ => false,
        }
    }

    /// Resolve an operand: quoted string, boolean/number literal, or a
    /// variable path. Unknown paths resolve to null.
    fn resolve_operand(&self, token: &str) -> JsonValue {
        let token = token.trim();
        if let Some(stripped) = strip_quotes(token) {
            return JsonValue::String(stripped.to_string());
        }
        match token {
            "true" | "True" | "yes" => return JsonValue::Bool(true),
            "false" | "False" | "no" => return JsonValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = token.parse::<i64>() {
            return JsonValue::from(i);
        }
        if let Ok(f) = token.parse::<f64>() {
            return JsonValue::from(f);
        }
        self.resolve_path(token).unwrap_or(JsonValue::Null)
    }

    /// Resolve a dot-separated variable path; `a.b[2]` indexes sequences
    /// with a nonnegative integer.
    fn resolve_path(&self, path: &str) -> Option<JsonValue> {
        crate::vars::lookup_path(self.vars, path)
    }
}

fn strip_quotes(token: &str) -> Option<&str> {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return Some(&token[1..token.len() - 1]);
        }
    }
    None
}

/// Find the first occurrence of ` word ` outside quotes and split there.
fn split_top_level<'e>(expr: &'e str, word: &str) -> Option<(&'e str, &'e str)> {
    let pattern = format!(" {} ", word);
    split_once_unquoted(expr, &pattern)
}

/// `str::split_once` that ignores occurrences inside quoted strings.
fn split_once_unquoted<'e>(expr: &'e str, pattern: &str) -> Option<(&'e str, &'e str)> {
    let bytes = expr.as_bytes();
    let pat = pattern.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + pat.len() <= bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if &bytes[i..i + pat.len()] == pat {
                    return Some((&expr[..i], &expr[i + pat.len()..]));
                }
            }
        }
        i += 1;
    }
    None
}

fn contains_unquoted(expr: &str, needles: &[char]) -> bool {
    let mut quote: Option<char> = None;
    for c in expr.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                } else if needles.contains(&c) {
                    return true;
                }
            }
        }
    }
    false
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return (x - y).abs() < f64::EPSILON;
    }
    match (a, b) {
        (JsonValue::String(_), _) | (_, JsonValue::String(_)) => {
            scalar_to_string(a) == scalar_to_string(b)
        }
        _ => a == b,
    }
}

/// Compare two operands: numeric when both coerce to numbers, string
/// comparison otherwise.
fn compare(op: &str, lhs: &JsonValue, rhs: &JsonValue) -> bool {
    if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
        return match op {
            "==" => (a - b).abs() < f64::EPSILON,
            "!=" => (a - b).abs() >= f64::EPSILON,
            ">=" => a >= b,
            "<=" => a <= b,
            ">" => a > b,
            "<" => a < b,
            _ => false,
        };
    }
    let a = scalar_to_string(lhs);
    let b = scalar_to_string(rhs);
    match op {
        "==" => a == b,
        "!=" => a != b,
        ">=" => a >= b,
        "<=" => a <= b,
        ">" => a > b,
        "<" => a < b,
        _ => false,
    }
}

/// Truthiness of a resolved value.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => {
            !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0" && !s.eq_ignore_ascii_case("no")
        }
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a task's `when`: a missing condition means run.
pub fn evaluate_when(cond: Option<&Condition>, vars: &VarMap) -> ConditionResult<bool> {
    match cond {
        None => Ok(true),
        Some(c) => ConditionEvaluator::new(vars).evaluate(c),
    }
}

/// Variable view with the result spliced in as `result`, `rc`, `stdout`,
/// and `stderr` for `failed_when`/`changed_when`/`until` expressions.
pub fn result_view(vars: &VarMap, result: &TaskResult) -> VarMap {
    let mut view = vars.clone();
    view.insert("result".into(), result.to_value());
    if let Some(rc) = result.exit_code() {
        view.insert("rc".into(), JsonValue::from(rc));
    }
    if let Some(stdout) = result.data.get("stdout") {
        view.insert("stdout".into(), stdout.clone());
    }
    if let Some(stderr) = result.data.get("stderr") {
        view.insert("stderr".into(), stderr.clone());
    }
    view
}

/// Evaluate `failed_when`: a missing condition falls back to the result's
/// own verdict.
pub fn evaluate_failed_when(
    cond: Option<&Condition>,
    result: &TaskResult,
    vars: &VarMap,
) -> ConditionResult<bool> {
    match cond {
        None => Ok(!result.success),
        Some(c) => {
            let view = result_view(vars, result);
            ConditionEvaluator::new(&view).evaluate(c)
        }
    }
}

/// Evaluate `changed_when`: a missing condition falls back to the result's
/// changed flag; `changed_when: false` forces false.
pub fn evaluate_changed_when(
    cond: Option<&Condition>,
    result: &TaskResult,
    vars: &VarMap,
) -> ConditionResult<bool> {
    match cond {
        None => Ok(result.changed),
        Some(Condition::Bool(b)) => Ok(*b),
        Some(c) => {
            let view = result_view(vars, result);
            ConditionEvaluator::new(&view).evaluate(c)
        }
    }
}

/// Materialize a task's loop expression into concrete items.
///
/// A literal sequence is identity; a string naming a sequence variable
/// unwraps; `"N-M"` expands to the inclusive integer range; any other value
/// yields a single-item sequence.
pub fn evaluate_loop_items(value: &JsonValue, vars: &VarMap) -> ConditionResult<Vec<JsonValue>> {
    match value {
        JsonValue::Array(items) => Ok(items.clone()),
        JsonValue::String(s) => {
            let name = s.trim();
            let name = name
                .strip_prefix("{{")
                .and_then(|r| r.strip_suffix("}}"))
                .map(str::trim)
                .unwrap_or(name);

            if let Some(resolved) = ConditionEvaluator::new(vars).resolve_path(name) {
                return match resolved {
                    JsonValue::Array(items) => Ok(items),
                    other => Ok(vec![other]),
                };
            }

            if let Some((start, end)) = name.split_once('-') {
                if let (Ok(start), Ok(end)) = (
                    start.trim().parse::<i64>(),
                    end.trim().parse::<i64>(),
                ) {
                    if start > end {
                        return Err(ConditionError::InvalidLoop(format!(
                            "descending range '{}'",
                            name
                        )));
                    }
                    return Ok((start..=end).map(JsonValue::from).collect());
                }
            }

            Ok(vec![value.clone()])
        }
        other => Ok(vec![other.clone()]),
    }
}
