//! A small CEL-style expression language evaluated over JSON facts.
//!
//! Supported syntax:
//!
//! - literals: integers, doubles, strings (`'..'` or `".."`), `true`,
//!   `false`, `null`, lists `[a, b]`
//! - member access `a.b`, indexing `a["b"]` / `a[0]`
//! - arithmetic `+ - * / %`, comparisons `== != < <= > >=`, `in`
//! - logic `&& || !` and the ternary `c ? a : b`
//! - functions `size(x)`, `int(x)`, `double(x)`, `string(x)`, `has(a.b)`,
//!   also callable as methods (`x.size()`)
//!
//! Evaluation is strict: type mismatches and missing fields are errors.

use serde_json::{Map, Number, Value};
use std::fmt;

use crate::error::{RatekeeperError, Result};

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Compile an expression, failing with a configuration error on bad syntax.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)
            .map_err(|e| RatekeeperError::Config(format!("expression {:?}: {}", source, e)))?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser
            .expression()
            .and_then(|node| parser.finish().map(|_| node))
            .map_err(|e| RatekeeperError::Config(format!("expression {:?}: {}", source, e)))?;

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether evaluation may read `root.field`, e.g. `request.body`.
    ///
    /// A bare `root` or a computed index into it counts as a read.
    pub fn references(&self, root: &str, field: &str) -> bool {
        references(&self.root, root, field)
    }

    /// Evaluate against an activation object whose top-level fields are the
    /// identifiers visible to the expression.
    pub fn evaluate(&self, activation: &Value) -> Result<Value> {
        eval(&self.root, activation)
            .map_err(|e| RatekeeperError::Extraction(format!("expression {:?}: {}", self.source, e)))
    }
}

#[derive(Debug)]
struct EvalError(String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type EvalResult<T> = std::result::Result<T, EvalError>;

fn err<T>(msg: impl Into<String>) -> EvalResult<T> {
    Err(EvalError(msg.into()))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Double(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCTUATION: &[&str] = &[
    "&&", "||", "==", "!=", "<=", ">=", "(", ")", "[", "]", ".", ",", "?", ":", "+", "-", "*",
    "/", "%", "!", "<", ">",
];

fn tokenize(source: &str) -> EvalResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_double =
                i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_double {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            if is_double {
                let value = text.parse().map_err(|_| EvalError(format!("bad number {}", text)))?;
                tokens.push(Token::Double(value));
            } else {
                let value = text.parse().map_err(|_| EvalError(format!("bad number {}", text)))?;
                tokens.push(Token::Int(value));
            }
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return err("unterminated string"),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = match chars.get(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some(&other) => other,
                            None => return err("unterminated escape"),
                        };
                        value.push(escaped);
                        i += 2;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let punct = PUNCTUATION
                .iter()
                .find(|p| rest.starts_with(**p))
                .ok_or_else(|| EvalError(format!("unexpected character {:?}", c)))?;
            tokens.push(Token::Punct(punct));
            i += punct.len();
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    List(Vec<Node>),
    Ident(String),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
    Unary(&'static str, Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, punct: &str) -> EvalResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            err(format!("expected {:?}, found {:?}", punct, self.peek()))
        }
    }

    fn finish(&self) -> EvalResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => err(format!("unexpected trailing {:?}", token)),
        }
    }

    fn expression(&mut self) -> EvalResult<Node> {
        let condition = self.binary(0)?;
        if self.eat("?") {
            let then = self.expression()?;
            self.expect(":")?;
            let otherwise = self.expression()?;
            return Ok(Node::Ternary(
                Box::new(condition),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(condition)
    }

    fn binary_op(&self, level: usize) -> Option<&'static str> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!=", "<", "<=", ">", ">=", "in"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        match self.peek()? {
            Token::Punct(p) => LEVELS[level].iter().find(|op| *op == p).copied(),
            Token::Ident(word) if word == "in" && level == 2 => Some("in"),
            _ => None,
        }
    }

    fn binary(&mut self, level: usize) -> EvalResult<Node> {
        if level == 5 {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        while let Some(op) = self.binary_op(level) {
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> EvalResult<Node> {
        if self.eat("!") {
            return Ok(Node::Unary("!", Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Node::Unary("-", Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> EvalResult<Node> {
        let mut node = self.primary()?;
        loop {
            if self.eat(".") {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => return err(format!("expected field name, found {:?}", other)),
                };
                if self.eat("(") {
                    let mut args = vec![node];
                    args.extend(self.arguments(")")?);
                    node = Node::Call(name, args);
                } else {
                    node = Node::Member(Box::new(node), name);
                }
            } else if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                node = Node::Index(Box::new(node), Box::new(index));
            } else {
                return Ok(node);
            }
        }
    }

    fn arguments(&mut self, close: &str) -> EvalResult<Vec<Node>> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(",")?;
        }
    }

    fn primary(&mut self) -> EvalResult<Node> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Node::Literal(Value::from(value))),
            Some(Token::Double(value)) => Ok(Node::Literal(Value::from(value))),
            Some(Token::Str(value)) => Ok(Node::Literal(Value::String(value))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                _ if self.eat("(") => Ok(Node::Call(word, self.arguments(")")?)),
                _ => Ok(Node::Ident(word)),
            },
            Some(Token::Punct("(")) => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => Ok(Node::List(self.arguments("]")?)),
            other => err(format!("unexpected {:?}", other)),
        }
    }
}

fn references(node: &Node, root: &str, field: &str) -> bool {
    let is_root = |target: &Node| matches!(target, Node::Ident(name) if name == root);
    match node {
        Node::Member(target, name) if is_root(&**target) => name == field,
        Node::Index(target, index) if is_root(&**target) => match &**index {
            Node::Literal(Value::String(name)) => name == field,
            _ => true,
        },
        Node::Ident(name) => name == root,
        Node::Literal(_) => false,
        Node::Member(target, _) | Node::Unary(_, target) => references(target, root, field),
        Node::Index(target, index) => references(target, root, field) || references(index, root, field),
        Node::List(items) | Node::Call(_, items) => items.iter().any(|item| references(item, root, field)),
        Node::Binary(_, left, right) => references(left, root, field) || references(right, root, field),
        Node::Ternary(condition, then, otherwise) => {
            references(condition, root, field)
                || references(then, root, field)
                || references(otherwise, root, field)
        }
    }
}

fn eval(node: &Node, activation: &Value) -> EvalResult<Value> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::List(items) => items
            .iter()
            .map(|item| eval(item, activation))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::Array),
        Node::Ident(name) => activation
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError(format!("undeclared reference to {}", name))),
        Node::Member(target, field) => {
            let target = eval(target, activation)?;
            match &target {
                Value::Object(map) => map
                    .get(field)
                    .cloned()
                    .ok_or_else(|| EvalError(format!("no such key: {}", field))),
                other => err(format!("cannot select {} from {}", field, type_name(other))),
            }
        }
        Node::Index(target, index) => {
            let target = eval(target, activation)?;
            let index = eval(index, activation)?;
            index_value(&target, &index)
        }
        Node::Call(name, args) => call(name, args, activation),
        Node::Unary(op, operand) => {
            let value = eval(operand, activation)?;
            match (*op, &value) {
                ("!", Value::Bool(b)) => Ok(Value::Bool(!b)),
                ("-", Value::Number(n)) => match n.as_i64() {
                    Some(i) => i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| EvalError("integer overflow".into())),
                    None => Ok(number(-as_f64(n))),
                },
                _ => err(format!("no such overload: {}{}", op, type_name(&value))),
            }
        }
        Node::Binary("&&", left, right) => {
            if !expect_bool(&eval(left, activation)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(expect_bool(&eval(right, activation)?)?))
        }
        Node::Binary("||", left, right) => {
            if expect_bool(&eval(left, activation)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(&eval(right, activation)?)?))
        }
        Node::Binary(op, left, right) => {
            let left = eval(left, activation)?;
            let right = eval(right, activation)?;
            binary(op, &left, &right)
        }
        Node::Ternary(condition, then, otherwise) => {
            if expect_bool(&eval(condition, activation)?)? {
                eval(then, activation)
            } else {
                eval(otherwise, activation)
            }
        }
    }
}

fn call(name: &str, args: &[Node], activation: &Value) -> EvalResult<Value> {
    if name == "has" {
        // has() tests field presence rather than evaluating the field.
        return match args {
            [Node::Member(target, field)] => match eval(target, activation)? {
                Value::Object(map) => Ok(Value::Bool(map.contains_key(field))),
                _ => Ok(Value::Bool(false)),
            },
            _ => err("has() expects a field selection"),
        };
    }

    let values = args
        .iter()
        .map(|arg| eval(arg, activation))
        .collect::<EvalResult<Vec<_>>>()?;
    let [value] = values.as_slice() else {
        return err(format!("{}() expects one argument", name));
    };

    match name {
        "size" => match value {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            Value::Object(map) => Ok(Value::from(map.len() as i64)),
            other => err(format!("size() unsupported for {}", type_name(other))),
        },
        "int" => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::from(i)),
                None => Ok(Value::from(as_f64(n).trunc() as i64)),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| EvalError(format!("cannot convert {:?} to int", s))),
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            other => err(format!("int() unsupported for {}", type_name(other))),
        },
        "double" => match value {
            Value::Number(n) => Ok(number(as_f64(n))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number)
                .map_err(|_| EvalError(format!("cannot convert {:?} to double", s))),
            other => err(format!("double() unsupported for {}", type_name(other))),
        },
        "string" => Ok(Value::String(to_display(value))),
        _ => err(format!("unknown function {}", name)),
    }
}

fn index_value(target: &Value, index: &Value) -> EvalResult<Value> {
    match (target, index) {
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError(format!("no such key: {}", key))),
        (Value::Array(items), Value::Number(n)) => n
            .as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| EvalError(format!("index {} out of range", n))),
        _ => err(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(index)
        )),
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> EvalResult<Value> {
    match op {
        "==" => Ok(Value::Bool(values_equal(left, right))),
        "!=" => Ok(Value::Bool(!values_equal(left, right))),
        "<" | "<=" | ">" | ">=" => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                EvalError(format!(
                    "no such overload: {} {} {}",
                    type_name(left),
                    op,
                    type_name(right)
                ))
            })?;
            let result = match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        "in" => match right {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| values_equal(v, left)))),
            Value::Object(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => err("map membership requires a string key"),
            },
            other => err(format!("'in' unsupported for {}", type_name(other))),
        },
        "+" => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        _ => arithmetic(op, left, right),
    }
}

fn arithmetic(op: &str, left: &Value, right: &Value) -> EvalResult<Value> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return err(format!(
            "no such overload: {} {} {}",
            type_name(left),
            op,
            type_name(right)
        ));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" if y == 0 => return err("division by zero"),
            "/" => x.checked_div(y),
            "%" if y == 0 => return err("modulus by zero"),
            "%" => x.checked_rem(y),
            _ => return err(format!("unknown operator {}", op)),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| EvalError("integer overflow".into()));
    }

    let (x, y) = (as_f64(a), as_f64(b));
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        "%" => x % y,
        _ => return err(format!("unknown operator {}", op)),
    };
    Ok(number(result))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => as_f64(a) == as_f64(b),
        _ => left == right,
    }
}

fn expect_bool(value: &Value) -> EvalResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => err(format!("expected bool, found {}", type_name(other))),
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Render a value the way `string()` does.
pub(crate) fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Build an activation object from named facts.
pub(crate) fn activation<I>(facts: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    let map: Map<String, Value> = facts
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn facts() -> Value {
        json!({
            "request": {
                "method": "POST",
                "path": "/v1/chat",
                "headers": {"x-tier": "gold", "x-tokens": "42"},
                "body": {"model": "large", "messages": [1, 2, 3]}
            },
            "response": {
                "status": 200,
                "body": {"usage": {"prompt_tokens": 10, "completion_tokens": 32}}
            }
        })
    }

    fn run(source: &str) -> Result<Value> {
        Expression::parse(source)?.evaluate(&facts())
    }

    #[test]
    fn test_member_access_and_arithmetic() {
        let value =
            run("response.body.usage.prompt_tokens + response.body.usage.completion_tokens * 2")
                .unwrap();
        assert_eq!(value, json!(74));
    }

    #[test]
    fn test_ternary_and_comparison() {
        let value = run("request.headers['x-tier'] == 'gold' ? 0.5 : 1").unwrap();
        assert_eq!(value, json!(0.5));

        let value = run("response.status >= 400 && response.status < 500").unwrap();
        assert_eq!(value, json!(false));
    }

    #[test]
    fn test_functions() {
        assert_eq!(run("size(request.body.messages)").unwrap(), json!(3));
        assert_eq!(run("request.body.messages.size()").unwrap(), json!(3));
        assert_eq!(run("int(request.headers['x-tokens']) / 4").unwrap(), json!(10));
        assert_eq!(run("double('2.5') * 2").unwrap(), json!(5.0));
        assert_eq!(run("string(response.status)").unwrap(), json!("200"));
        assert_eq!(run("has(request.body.model)").unwrap(), json!(true));
        assert_eq!(run("has(request.body.stream)").unwrap(), json!(false));
    }

    #[test]
    fn test_in_operator_and_strings() {
        assert_eq!(run("request.method in ['POST', 'PUT']").unwrap(), json!(true));
        assert_eq!(run("'x-tier' in request.headers").unwrap(), json!(true));
        assert_eq!(run("request.method + ':' + request.path").unwrap(), json!("POST:/v1/chat"));
    }

    #[test]
    fn test_evaluation_errors() {
        assert!(matches!(
            run("request.body.missing"),
            Err(RatekeeperError::Extraction(_))
        ));
        assert!(run("1 / 0").is_err());
        assert!(run("request.method + 1").is_err());
        assert!(run("1 && true").is_err());
    }

    #[test]
    fn test_syntax_errors_are_config_errors() {
        for source in ["request.", "(1 + 2", "1 +", "a ? b", "'open", "1 2", "#"] {
            assert!(
                matches!(Expression::parse(source), Err(RatekeeperError::Config(_))),
                "{} should not compile",
                source
            );
        }
    }

    #[test]
    fn test_precedence() {
        assert_eq!(run("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(run("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(run("-2 * 3 + 10 % 4").unwrap(), json!(-4));
        assert_eq!(run("!false || false && false").unwrap(), json!(true));
    }

    #[test]
    fn test_references_body() {
        let reads = |source: &str| Expression::parse(source).unwrap().references("request", "body");

        assert!(reads("size(request.body.messages) * 10"));
        assert!(reads("request['body'].model == 'large' ? 2 : 1"));
        assert!(reads("has(request.body.model)"));
        assert!(reads("string(request)"));
        assert!(reads("request[request.headers['x-field']]"));

        assert!(!reads("request.headers['x-tokens']"));
        assert!(!reads("response.body.usage.total_tokens"));
        assert!(!reads("request.metadata.body"));
    }
}
