//! ABOUTME: ConditionalEvaluator — safe tokenize/parse/evaluate of boolean expressions
//! ABOUTME: Original recursive-descent parser; never invokes host-language code on user input

use crate::context::{resolve_reference, ExecutionContext};
use pilot_core::{PilotError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Structured condition shapes (spec.md §4.3): simple field/operator/value
/// comparisons, boolean combinators, and raw string expressions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Simple {
        field: String,
        operator: String,
        #[serde(default)]
        value: Value,
    },
    And {
        and: Vec<Condition>,
    },
    Or {
        or: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    Expression(String),
}

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Canonicalizes operator aliases to a single stable name.
fn canonical_operator(op: &str) -> &str {
    match op {
        "==" | "eq" | "equals" => "==",
        "!=" | "ne" | "not_equals" => "!=",
        ">" | "gt" | "greater_than" => ">",
        ">=" | "gte" | "greater_than_or_equal" => ">=",
        "<" | "lt" | "less_than" => "<",
        "<=" | "lte" | "less_than_or_equal" => "<=",
        "contains" => "contains",
        "not_contains" | "does_not_contain" => "not_contains",
        "in" => "in",
        "not_in" => "not_in",
        "exists" => "exists",
        "not_exists" => "not_exists",
        "is_empty" | "empty" => "is_empty",
        "is_not_empty" | "not_empty" => "is_not_empty",
        "matches" | "regex" => "matches",
        "starts_with" | "startswith" => "starts_with",
        "ends_with" | "endswith" => "ends_with",
        other => other,
    }
}

const KNOWN_OPERATORS: &[&str] = &[
    "==",
    "!=",
    ">",
    ">=",
    "<",
    "<=",
    "contains",
    "not_contains",
    "in",
    "not_in",
    "exists",
    "not_exists",
    "is_empty",
    "is_not_empty",
    "matches",
    "starts_with",
    "ends_with",
];

pub struct ConditionalEvaluator;

impl ConditionalEvaluator {
    /// Validate a condition's shape without evaluating it (spec.md §4.3
    /// "Validation mode"), used by the Planner and authoring tools.
    #[must_use]
    pub fn validate(condition: &Condition) -> ValidationResult {
        let mut errors = Vec::new();
        Self::validate_inner(condition, &mut errors);
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }

    fn validate_inner(condition: &Condition, errors: &mut Vec<String>) {
        match condition {
            Condition::Simple { field, operator, .. } => {
                if field.trim().is_empty() {
                    errors.push("simple condition missing field".to_string());
                }
                if !KNOWN_OPERATORS.contains(&canonical_operator(operator)) {
                    errors.push(format!("unknown operator '{operator}'"));
                }
            }
            Condition::And { and } | Condition::Or { or: and } => {
                if and.is_empty() {
                    errors.push("and/or condition has no members".to_string());
                }
                for c in and {
                    Self::validate_inner(c, errors);
                }
            }
            Condition::Not { not } => Self::validate_inner(not, errors),
            Condition::Expression(expr) => {
                if let Err(e) = tokenize(expr).and_then(|tokens| Parser::new(tokens).parse_expression_only()) {
                    errors.push(e.to_string());
                }
            }
        }
    }

    /// Evaluate a condition against the execution context. Never executes
    /// host code: string expressions go through `tokenize` → `Parser` →
    /// `Interpreter`, operating purely on an AST of literals/operators.
    pub fn evaluate(condition: &Condition, ctx: &ExecutionContext, locals: &HashMap<String, Value>) -> Result<bool> {
        match condition {
            Condition::Simple { field, operator, value } => {
                let field_value = resolve_reference(ctx, locals, field).unwrap_or(Value::Null);
                evaluate_simple(&field_value, canonical_operator(operator), value)
            }
            Condition::And { and } => {
                for c in and {
                    if !Self::evaluate(c, ctx, locals)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { or } => {
                for c in or {
                    if Self::evaluate(c, ctx, locals)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { not } => Ok(!Self::evaluate(not, ctx, locals)?),
            Condition::Expression(expr) => evaluate_expression(expr, ctx, locals),
        }
    }
}

/// Evaluates a single binary comparison between two already-resolved
/// values, for callers (the `comparison` step kind) that hold both sides
/// directly rather than a field reference to resolve.
pub(crate) fn evaluate_binary(left: &Value, operator: &str, right: &Value) -> Result<bool> {
    evaluate_simple(left, canonical_operator(operator), right)
}

fn evaluate_simple(field_value: &Value, operator: &str, rhs: &Value) -> Result<bool> {
    Ok(match operator {
        "==" => values_equal(field_value, rhs),
        "!=" => !values_equal(field_value, rhs),
        ">" => compare_numbers(field_value, rhs).map(|o| o.is_gt()).unwrap_or(false),
        ">=" => compare_numbers(field_value, rhs).map(|o| o.is_ge()).unwrap_or(false),
        "<" => compare_numbers(field_value, rhs).map(|o| o.is_lt()).unwrap_or(false),
        "<=" => compare_numbers(field_value, rhs).map(|o| o.is_le()).unwrap_or(false),
        "contains" => contains(field_value, rhs),
        "not_contains" => !contains(field_value, rhs),
        "in" => contains(rhs, field_value),
        "not_in" => !contains(rhs, field_value),
        "exists" => !field_value.is_null(),
        "not_exists" => field_value.is_null(),
        "is_empty" => is_empty(field_value),
        "is_not_empty" => !is_empty(field_value),
        "matches" => {
            let pattern = rhs.as_str().unwrap_or_default();
            let haystack = field_value.as_str().map(str::to_string).unwrap_or_else(|| field_value.to_string());
            regex::Regex::new(pattern)
                .map_err(|e| PilotError::condition(format!("invalid regex '{pattern}': {e}")))?
                .is_match(&haystack)
        }
        "starts_with" => as_text(field_value).starts_with(&as_text(rhs)),
        "ends_with" => as_text(field_value).ends_with(&as_text(rhs)),
        other => return Err(PilotError::condition(format!("unknown operator '{other}'"))),
    })
}

fn as_text(value: &Value) -> String {
    value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return (x - y).abs() < f64::EPSILON;
    }
    a == b
}

fn compare_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let (x, y) = (a.as_f64(), b.as_f64());
    if let (Some(x), Some(y)) = (x, y) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(arr) => arr.iter().any(|v| values_equal(v, needle)),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Object(map) => needle.as_str().map(|n| map.contains_key(n)).unwrap_or(false),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------
// String-expression tokenizer + recursive-descent parser + interpreter
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(PilotError::condition("unterminated string literal"));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| PilotError::condition(format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            _ if c.is_alphanumeric() || c == '_' || c == '.' || c == '[' || c == ']' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '[' || chars[i] == ']')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::Ident("true".to_string()),
                    "false" => Token::Ident("false".to_string()),
                    "null" => Token::Ident("null".to_string()),
                    _ => Token::Ident(text),
                });
            }
            other => {
                return Err(PilotError::condition(format!(
                    "unexpected character '{other}' — expressions are parsed, not executed"
                )))
            }
        }
    }
    Ok(tokens)
}

/// AST emitted by the parser. No variant can cause host-language
/// evaluation: `Literal` carries only JSON-safe values.
#[derive(Debug, Clone)]
enum Ast {
    Literal(Value),
    Ident(String),
    Comparison { left: Box<Ast>, op: Token, right: Box<Ast> },
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse_expression_only(&mut self) -> Result<()> {
        self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(PilotError::condition("unexpected trailing tokens in expression"));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse(&mut self) -> Result<Ast> {
        let ast = self.parse_or()?;
        if self.pos != self.tokens.len() {
            return Err(PilotError::condition("unexpected trailing tokens in expression"));
        }
        Ok(ast)
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            return Ok(Ast::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Ast> {
        let left = self.parse_primary()?;
        if let Some(op @ (Token::Eq | Token::Ne | Token::Gt | Token::Ge | Token::Lt | Token::Le)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Ast::Comparison {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(PilotError::condition("expected closing ')'")),
                }
            }
            Some(Token::Number(n)) => Ok(Ast::Literal(serde_json::json!(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::Ident(i)) if i == "true" => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::Ident(i)) if i == "false" => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Ident(i)) if i == "null" => Ok(Ast::Literal(Value::Null)),
            Some(Token::Ident(i)) => Ok(Ast::Ident(i)),
            other => Err(PilotError::condition(format!("unexpected token {other:?} — expected a value"))),
        }
    }
}

struct Interpreter<'a> {
    ctx: &'a ExecutionContext,
    locals: &'a HashMap<String, Value>,
}

impl Interpreter<'_> {
    fn eval(&self, ast: &Ast) -> Result<Value> {
        match ast {
            Ast::Literal(v) => Ok(v.clone()),
            Ast::Ident(name) => Ok(resolve_reference(self.ctx, self.locals, name).unwrap_or(Value::Null)),
            Ast::Comparison { left, op, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let result = match op {
                    Token::Eq => values_equal(&l, &r),
                    Token::Ne => !values_equal(&l, &r),
                    Token::Gt => compare_numbers(&l, &r).map(|o| o.is_gt()).unwrap_or(false),
                    Token::Ge => compare_numbers(&l, &r).map(|o| o.is_ge()).unwrap_or(false),
                    Token::Lt => compare_numbers(&l, &r).map(|o| o.is_lt()).unwrap_or(false),
                    Token::Le => compare_numbers(&l, &r).map(|o| o.is_le()).unwrap_or(false),
                    _ => unreachable!("only comparison tokens reach here"),
                };
                Ok(Value::Bool(result))
            }
            Ast::And(l, r) => Ok(Value::Bool(truthy(&self.eval(l)?) && truthy(&self.eval(r)?))),
            Ast::Or(l, r) => Ok(Value::Bool(truthy(&self.eval(l)?) || truthy(&self.eval(r)?))),
            Ast::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Pre-resolves `{{…}}` variable references in the expression against the
/// context, injecting their resolved values as JSON-safe literals before
/// tokenizing — so the parser only ever sees literals and operators
/// (spec.md §4.3 "Pre-resolution").
fn pre_resolve(expr: &str, ctx: &ExecutionContext, locals: &HashMap<String, Value>) -> String {
    let re = regex::Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap();
    re.replace_all(expr, |caps: &regex::Captures| {
        let reference = &caps[1];
        match resolve_reference(ctx, locals, reference) {
            Ok(value) => literal_text(&value),
            Err(_) => caps[0].to_string(),
        }
    })
    .into_owned()
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => other.to_string(),
    }
}

fn evaluate_expression(expr: &str, ctx: &ExecutionContext, locals: &HashMap<String, Value>) -> Result<bool> {
    let resolved = pre_resolve(expr, ctx, locals);
    let tokens = tokenize(&resolved)?;
    let ast = Parser::new(tokens).parse()?;
    let interpreter = Interpreter { ctx, locals };
    Ok(truthy(&interpreter.eval(&ast)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::RunMode;
    use std::time::Duration;

    fn ctx_with(step1_score: i64, step2_ok: bool) -> ExecutionContext {
        let ctx = ExecutionContext::new("e", "a", "u", "s", Value::Null, RunMode::Production);
        ctx.set_step_output(
            "1",
            pilot_core::StepOutput::success("1", "s", "k", serde_json::json!({"score": step1_score}), Duration::from_millis(1)),
        );
        ctx.set_step_output(
            "2",
            pilot_core::StepOutput::success("2", "s", "k", serde_json::json!({"ok": step2_ok}), Duration::from_millis(1)),
        );
        ctx
    }

    #[test]
    fn s4_safe_expression_true_and_false() {
        let ctx = ctx_with(85, true);
        let result = evaluate_expression("step1.data.score > 70 && step2.data.ok", &ctx, &HashMap::new()).unwrap();
        assert!(result);

        let ctx = ctx_with(50, true);
        let result = evaluate_expression("step1.data.score > 70 && step2.data.ok", &ctx, &HashMap::new()).unwrap();
        assert!(!result);
    }

    #[test]
    fn s4_smuggled_code_is_a_parse_error_not_a_call() {
        let ctx = ctx_with(1, true);
        let err = evaluate_expression("(()=>1)()", &ctx, &HashMap::new()).unwrap_err();
        assert!(matches!(err, PilotError::Condition { .. }));
    }

    #[test]
    fn simple_condition_greater_than() {
        let ctx = ctx_with(85, true);
        let cond = Condition::Simple {
            field: "step1.data.score".to_string(),
            operator: ">".to_string(),
            value: serde_json::json!(70),
        };
        assert!(ConditionalEvaluator::evaluate(&cond, &ctx, &HashMap::new()).unwrap());
    }

    #[test]
    fn complex_and_or_not_short_circuit() {
        let ctx = ctx_with(10, false);
        let cond = Condition::Not {
            not: Box::new(Condition::And {
                and: vec![
                    Condition::Simple {
                        field: "step1.data.score".to_string(),
                        operator: ">".to_string(),
                        value: serde_json::json!(100),
                    },
                    Condition::Simple {
                        field: "step2.data.ok".to_string(),
                        operator: "==".to_string(),
                        value: Value::Bool(true),
                    },
                ],
            }),
        };
        assert!(ConditionalEvaluator::evaluate(&cond, &ctx, &HashMap::new()).unwrap());
    }

    #[test]
    fn validate_mode_does_not_evaluate() {
        let cond = Condition::Expression("1 + +".to_string());
        let result = ConditionalEvaluator::validate(&cond);
        assert!(!result.valid);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn operator_aliases_resolve_to_canonical() {
        assert_eq!(canonical_operator("eq"), "==");
        assert_eq!(canonical_operator("greater_than_or_equal"), ">=");
    }

    #[test]
    fn exists_and_is_empty_operators() {
        let field_value = Value::Null;
        assert!(evaluate_simple(&field_value, "not_exists", &Value::Null).unwrap());
        assert!(evaluate_simple(&Value::String(String::new()), "is_empty", &Value::Null).unwrap());
        assert!(evaluate_simple(&Value::String("x".into()), "is_not_empty", &Value::Null).unwrap());
    }
}
