//! Formula language of the in-memory engine.
//!
//! A formula is either a single-expression function definition
//!
//! ```text
//! def premium(t):
//!     return base * 1.02 ** t if t > 0 else base
//! ```
//!
//! or a lambda (`lambda t: t + 1`). Expressions cover literals, names,
//! calls, subscripts, arithmetic, comparisons, boolean operators and the
//! conditional expression. The same expression parser reads argument
//! literals such as `(1, 'a')` sent by the front end.

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::value::Value;
use regex::Regex;
use std::sync::LazyLock;

static DEF_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*:(.*)$")
        .expect("def header regex must compile")
});

static LAMBDA_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^lambda\b([^:]*):(.*)$").expect("lambda header regex must compile")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex must compile")
});

const KEYWORDS: &[&str] = &[
    "True", "False", "None", "and", "or", "not", "if", "else", "lambda", "def", "return",
];

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl Expr {
    /// Constant value of a literal-only expression.
    ///
    /// Returns `None` as soon as a name, call or operator other than unary
    /// minus appears.
    pub fn literal_value(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Tuple(items) => literal_items(items).map(Value::Tuple),
            Expr::List(items) => literal_items(items).map(Value::List),
            Expr::Set(items) => literal_items(items).map(Value::Set),
            Expr::Dict(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    match key.literal_value()? {
                        Value::Str(key) => {
                            map.insert(key, value.literal_value()?);
                        }
                        _ => return None,
                    }
                }
                Some(Value::Dict(map))
            }
            Expr::Neg(inner) => match inner.literal_value()? {
                Value::Int(i) => i.checked_neg().map(Value::Int),
                Value::Float(f) => Some(Value::Float(-f)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn literal_items(items: &[Expr]) -> Option<Vec<Value>> {
    items.iter().map(Expr::literal_value).collect()
}

/// A cells formula: optional declared name, parameters and body expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    name: Option<String>,
    params: Vec<String>,
    source: String,
    body: Expr,
}

impl Formula {
    /// Parse a `def` or `lambda` formula.
    pub fn parse(source: &str) -> Result<Self> {
        let text = source.trim();

        if let Some(caps) = DEF_HEADER.captures(text) {
            let name = caps[1].to_string();
            let params = parse_params(&caps[2])?;
            let body = parse_def_body(&caps[3])?;
            return Ok(Self {
                name: Some(name),
                params,
                source: text.to_string(),
                body,
            });
        }

        if let Some(caps) = LAMBDA_HEADER.captures(text) {
            let params = parse_params(&caps[1])?;
            let body = parse_expression(&caps[2]).map_err(formula_error)?;
            return Ok(Self {
                name: None,
                params,
                source: text.to_string(),
                body,
            });
        }

        Err(KernelError::Formula {
            message: "formula must be a function definition or a lambda expression".to_string(),
        })
    }

    /// Formula bound to cells created without one.
    pub fn stub() -> Self {
        Self {
            name: None,
            params: Vec::new(),
            source: KernelConfig::DEFAULT_FORMULA.to_string(),
            body: Expr::Literal(Value::None),
        }
    }

    /// Name declared by a `def` formula.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn body(&self) -> &Expr {
        &self.body
    }

    /// Same formula declared under another name.
    ///
    /// For `def` formulas the header is rewritten so the stored source
    /// matches the name the cells are bound to.
    pub fn renamed(&self, name: &str) -> Self {
        let source = match &self.name {
            Some(old) if old != name => {
                let rest = self.source.trim_start_matches("def").trim_start();
                let rest = rest.strip_prefix(old.as_str()).unwrap_or(rest);
                format!("def {}{}", name, rest)
            }
            _ => self.source.clone(),
        };
        let name = self.name.as_ref().map(|_| name.to_string());
        Self {
            name,
            params: self.params.clone(),
            source,
            body: self.body.clone(),
        }
    }
}

/// Check that `name` can be bound and referenced from formulas.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name) && !KEYWORDS.contains(&name)
}

/// Parse console literal text such as `(1, 'a')` into a value.
pub fn parse_literal(text: &str) -> Result<Value> {
    let expr = parse_expression(text).map_err(|message| KernelError::Parse { message })?;
    expr.literal_value().ok_or_else(|| KernelError::Parse {
        message: format!("malformed literal: {}", text.trim()),
    })
}

/// Parse a single expression.
pub fn parse_expression(text: &str) -> std::result::Result<Expr, String> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err("Empty expression".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("Unexpected token: {:?}", parser.tokens[parser.pos]));
    }
    Ok(expr)
}

fn formula_error(message: String) -> KernelError {
    KernelError::Formula { message }
}

fn parse_params(text: &str) -> Result<Vec<String>> {
    let mut params: Vec<String> = Vec::new();
    for raw in text.split(',') {
        let param = raw.trim();
        if param.is_empty() {
            continue;
        }
        if !IDENTIFIER.is_match(param) || KEYWORDS.contains(&param) {
            return Err(formula_error(format!("unsupported parameter: {}", param)));
        }
        if params.iter().any(|p| p == param) {
            return Err(formula_error(format!("duplicate parameter: {}", param)));
        }
        params.push(param.to_string());
    }
    Ok(params)
}

fn parse_def_body(text: &str) -> Result<Expr> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    let body = lines.join(" ");

    let rest = body
        .strip_prefix("return")
        .filter(|rest| rest.is_empty() || rest.starts_with([' ', '(', '[', '{', '\'', '"']))
        .ok_or_else(|| formula_error("function body must be a single return statement".to_string()))?;

    if rest.trim().is_empty() {
        return Ok(Expr::Literal(Value::None));
    }
    parse_expression(rest).map_err(formula_error)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]",
    "{", "}", ",", ":",
];

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' | '\\' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err("Unterminated string literal".to_string()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| "Unterminated string literal".to_string())?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '0' => '\0',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' if c != '.' || chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if matches!(chars.get(i), Some('e') | Some('E')) {
                    let mut j = i + 1;
                    if matches!(chars.get(j), Some('+') | Some('-')) {
                        j += 1;
                    }
                    if chars.get(j).is_some_and(|d| d.is_ascii_digit()) {
                        is_float = true;
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().filter(|ch| **ch != '_').collect();
                if is_float {
                    let f = text.parse::<f64>().map_err(|_| format!("Invalid number: {}", text))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n = text.parse::<i64>().map_err(|_| format!("Invalid number: {}", text))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let punct = PUNCTS
                    .iter()
                    .find(|p| rest.starts_with(**p))
                    .ok_or_else(|| format!("Unexpected character: {}", c))?;
                tokens.push(Token::Punct(punct));
                i += punct.len();
            }
        }
    }

    Ok(tokens)
}

/// Recursive-descent parser over a token list.
///
/// `depth` counts open nesting levels plus operator chain links, so the depth
/// of any tree it builds stays within `KernelConfig::MAX_PARSE_DEPTH`.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > KernelConfig::MAX_PARSE_DEPTH {
            return Err(format!(
                "Expression nested deeper than {} levels",
                KernelConfig::MAX_PARSE_DEPTH
            ));
        }
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(q)) if *q == p)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> std::result::Result<(), String> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(format!("Expected '{}'", p))
        }
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        self.descend()?;
        let expr = self.conditional()?;
        self.ascend(1);
        Ok(expr)
    }

    fn conditional(&mut self) -> std::result::Result<Expr, String> {
        let value = self.or_test()?;
        if self.eat_keyword("if") {
            let cond = self.or_test()?;
            if !self.eat_keyword("else") {
                return Err("Expected 'else' in conditional expression".to_string());
            }
            let otherwise = self.expr()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn or_test(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and_test()?;
        let mut links = 0;
        while self.eat_keyword("or") {
            self.descend()?;
            links += 1;
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn and_test(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.not_test()?;
        let mut links = 0;
        while self.eat_keyword("and") {
            self.descend()?;
            links += 1;
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.ascend(links);
        Ok(left)
    }

    fn not_test(&mut self) -> std::result::Result<Expr, String> {
        if self.eat_keyword("not") {
            self.descend()?;
            let inner = self.not_test()?;
            self.ascend(1);
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<Expr, String> {
        let left = self.arith()?;
        let op = match self.peek() {
            Some(Token::Punct("==")) => CmpOp::Eq,
            Some(Token::Punct("!=")) => CmpOp::NotEq,
            Some(Token::Punct("<")) => CmpOp::Lt,
            Some(Token::Punct("<=")) => CmpOp::LtEq,
            Some(Token::Punct(">")) => CmpOp::Gt,
            Some(Token::Punct(">=")) => CmpOp::GtEq,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.arith()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.term()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("+")) => BinOp::Add,
                Some(Token::Punct("-")) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            links += 1;
            let right = self.term()?;
            left = binary(op, left, right);
        }
        self.ascend(links);
        Ok(left)
    }

    fn term(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.factor()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Punct("*")) => BinOp::Mul,
                Some(Token::Punct("/")) => BinOp::Div,
                Some(Token::Punct("//")) => BinOp::FloorDiv,
                Some(Token::Punct("%")) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            links += 1;
            let right = self.factor()?;
            left = binary(op, left, right);
        }
        self.ascend(links);
        Ok(left)
    }

    fn factor(&mut self) -> std::result::Result<Expr, String> {
        if self.eat_punct("-") {
            self.descend()?;
            let inner = self.factor()?;
            self.ascend(1);
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat_punct("+") {
            self.descend()?;
            let inner = self.factor()?;
            self.ascend(1);
            return Ok(inner);
        }
        self.power()
    }

    fn power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.primary()?;
        if self.eat_punct("**") {
            self.descend()?;
            let exponent = self.factor()?;
            self.ascend(1);
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        let mut expr = self.atom()?;
        let mut links = 0;
        loop {
            if self.at_punct("(") {
                let func = match expr {
                    Expr::Name(name) => name,
                    _ => return Err("Only named functions can be called".to_string()),
                };
                self.pos += 1;
                let (args, _) = self.sequence(")")?;
                expr = Expr::Call { func, args };
            } else if self.eat_punct("[") {
                self.descend()?;
                links += 1;
                let index = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                self.ascend(links);
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close`; reports a trailing comma.
    fn sequence(&mut self, close: &str) -> std::result::Result<(Vec<Expr>, bool), String> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        while !self.eat_punct(close) {
            items.push(self.expr()?);
            trailing_comma = self.eat_punct(",");
            if !trailing_comma {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok((items, trailing_comma))
    }

    fn atom(&mut self) -> std::result::Result<Expr, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "Unexpected end of expression".to_string())?;
        self.pos += 1;

        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(s) => {
                // Adjacent string literals concatenate.
                let mut s = s;
                while let Some(Token::Str(next)) = self.peek() {
                    s.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Literal(Value::Str(s)))
            }
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::None)),
                kw if KEYWORDS.contains(&kw) => Err(format!("Unexpected keyword: {}", kw)),
                _ => Ok(Expr::Name(name)),
            },
            Token::Punct("(") => {
                let (items, trailing_comma) = self.sequence(")")?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Expr::Tuple(Vec::new())))
                } else {
                    Ok(Expr::Tuple(items))
                }
            }
            Token::Punct("[") => Ok(Expr::List(self.sequence("]")?.0)),
            Token::Punct("{") => self.brace(),
            other => Err(format!("Unexpected token: {:?}", other)),
        }
    }

    fn brace(&mut self) -> std::result::Result<Expr, String> {
        if self.eat_punct("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.expr()?;
        if self.eat_punct(":") {
            let value = self.expr()?;
            let mut entries = vec![(first, value)];
            while self.eat_punct(",") {
                if self.at_punct("}") {
                    break;
                }
                let key = self.expr()?;
                self.expect_punct(":")?;
                entries.push((key, self.expr()?));
            }
            self.expect_punct("}")?;
            return Ok(Expr::Dict(entries));
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            if self.at_punct("}") {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_punct("}")?;
        Ok(Expr::Set(items))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_def_formula() {
        let formula = Formula::parse("def foo(x, y):\n    return x + y * 2").unwrap();
        assert_eq!(formula.name(), Some("foo"));
        assert_eq!(formula.params(), &["x".to_string(), "y".to_string()]);
        assert!(matches!(
            formula.body(),
            Expr::Binary { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn test_parse_one_line_def() {
        let formula = Formula::parse("def foo(): return 1").unwrap();
        assert_eq!(formula.name(), Some("foo"));
        assert!(formula.params().is_empty());
        assert_eq!(formula.body(), &Expr::Literal(Value::Int(1)));
    }

    #[test]
    fn test_parse_lambda_formula() {
        let formula = Formula::parse("lambda t: t - 1").unwrap();
        assert_eq!(formula.name(), None);
        assert_eq!(formula.params(), &["t".to_string()]);
    }

    #[test]
    fn test_bare_return_is_none() {
        let formula = Formula::parse("def foo():\n    return").unwrap();
        assert_eq!(formula.body(), &Expr::Literal(Value::None));
    }

    #[test]
    fn test_invalid_formulas() {
        assert!(matches!(
            Formula::parse("x = 1"),
            Err(KernelError::Formula { .. })
        ));
        assert!(Formula::parse("def foo(x, x): return x").is_err());
        assert!(Formula::parse("def foo(x=1): return x").is_err());
        assert!(Formula::parse("def foo():\n    y = 1\n    return y").is_err());
        assert!(Formula::parse("lambda: (1 +").is_err());
    }

    #[test]
    fn test_renamed_rewrites_def_header() {
        let formula = Formula::parse("def foo(): return 2").unwrap();
        let renamed = formula.renamed("bar");
        assert_eq!(renamed.name(), Some("bar"));
        assert_eq!(renamed.source(), "def bar(): return 2");

        let lambda = Formula::parse("lambda: 3").unwrap().renamed("baz");
        assert_eq!(lambda.name(), None);
        assert_eq!(lambda.source(), "lambda: 3");
    }

    #[test]
    fn test_stub_formula() {
        let stub = Formula::stub();
        assert_eq!(stub.source(), "lambda: None");
        assert!(stub.params().is_empty());
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3 ** 2").unwrap();
        match expr {
            Expr::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected tree: {:?}", other),
        }

        let cond = parse_expression("a if t > 0 else b").unwrap();
        assert!(matches!(cond, Expr::IfElse { .. }));
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal("()").unwrap(), Value::tuple([]));
        assert_eq!(parse_literal("(1,)").unwrap(), Value::tuple([Value::Int(1)]));
        assert_eq!(parse_literal("(1)").unwrap(), Value::Int(1));
        assert_eq!(
            parse_literal("(-2, 'a', 1.5, None, [True])").unwrap(),
            Value::tuple([
                Value::Int(-2),
                Value::str("a"),
                Value::Float(1.5),
                Value::None,
                Value::List(vec![Value::Bool(true)]),
            ])
        );
        assert_eq!(
            parse_literal("{'k': (1, 2)}").unwrap().as_dict().unwrap()["k"],
            Value::tuple([Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_parse_literal_rejects_expressions() {
        assert!(matches!(parse_literal("x"), Err(KernelError::Parse { .. })));
        assert!(matches!(parse_literal("(1 + 2,)"), Err(KernelError::Parse { .. })));
        assert!(parse_literal("").is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("foo_1"));
        assert!(!is_identifier("1foo"));
        assert!(!is_identifier("lambda"));
        assert!(!is_identifier("a.b"));
    }

    #[test]
    fn test_tokenize_numbers_and_strings() {
        let tokens = tokenize("1_000 2.5 1e3 .5 'a\\'b'").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Int(1000),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Float(0.5),
                Token::Str("a'b".to_string()),
            ]
        );
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a $ b").is_err());
    }

    #[test]
    fn test_nesting_within_limit_parses() {
        let text = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(parse_literal(&text).unwrap(), Value::Int(1));

        let nested = format!("{}{}", "[".repeat(30), "]".repeat(30));
        assert!(parse_literal(&nested).is_ok());
    }

    #[test]
    fn test_deep_nesting_is_a_parse_error() {
        let err = parse_literal(&"(".repeat(200_000)).unwrap_err();
        assert!(matches!(err, KernelError::Parse { .. }));
        assert!(err.to_string().contains("nested deeper"));

        assert!(parse_expression(&"[".repeat(50_000)).is_err());
        assert!(parse_expression(&"{1: ".repeat(50_000)).is_err());
    }

    #[test]
    fn test_long_unary_and_operator_chains_are_bounded() {
        assert!(parse_expression(&format!("{}1", "-".repeat(100_000))).is_err());
        assert!(parse_expression(&format!("{}x", "not ".repeat(100_000))).is_err());
        assert!(parse_expression(&format!("1{}", " + 1".repeat(100_000))).is_err());
        assert!(parse_expression(&format!("x{}", "[0]".repeat(100_000))).is_err());

        assert!(parse_expression(&format!("1{}", " + 1".repeat(20))).is_ok());
        assert!(parse_expression("--1 if not not x else 2 ** -3").is_ok());
    }

    #[test]
    fn test_deep_formula_is_a_formula_error() {
        let source = format!("lambda: {}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(
            Formula::parse(&source),
            Err(KernelError::Formula { .. })
        ));
    }
}
