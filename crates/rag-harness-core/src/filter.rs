//! Metadata filter grammar.
//!
//! Filters narrow a similarity search to chunks whose document metadata
//! matches. The grammar:
//!
//! ```text
//! filter     := term ( ("AND" | "OR") term )*
//! term       := [ "-" | "NOT" ] ( text_expr | num_expr | "(" filter ")" )
//! text_expr  := FIELD ":" "ANY" "(" STRING ( "," STRING )* ")"
//! num_expr   := FIELD ":" "IN" "(" bound "," bound ")"
//!             | FIELD ( "<" | "<=" | ">=" | ">" | "=" ) NUMBER
//! bound      := NUMBER [ "i" | "e" ] | "*"
//! ```
//!
//! `AND` and `OR` have equal precedence and chain left to right; use
//! parentheses to group. Consecutive uses of the same operator collapse
//! into one flat clause list.
//!
//! The parsed [`FilterExpr`] is backend-neutral. [`FilterExpr::to_json`]
//! renders the nested-dictionary form; vector stores compile the tree into
//! their own native syntax.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

/// A malformed filter string.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid filter at offset {position}: {message}")]
pub struct FilterParseError {
    pub position: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "=",
            CompareOp::Ge => ">=",
            CompareOp::Gt => ">",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end of an `IN(lower, upper)` range.
///
/// Lower bounds default to inclusive, upper bounds to exclusive; an explicit
/// `i` or `e` suffix overrides the default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub value: f64,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// `field:ANY("a","b")`
    AnyOf { field: String, values: Vec<String> },
    /// `field > 3`
    Compare {
        field: String,
        op: CompareOp,
        value: f64,
    },
    /// `field:IN(1, *)`; `None` is the `*` wildcard.
    Range {
        field: String,
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
    Not(Box<FilterExpr>),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Render as nested `{field: {OP: value}}` dictionaries.
    pub fn to_json(&self) -> Value {
        match self {
            FilterExpr::AnyOf { field, values } => json!({ field.as_str(): { "IN": values } }),
            FilterExpr::Compare { field, op, value } => {
                json!({ field.as_str(): { op.as_str(): number(*value) } })
            }
            FilterExpr::Range {
                field,
                lower,
                upper,
            } => {
                let lo = lower.map(|b| number(b.value)).unwrap_or(Value::Null);
                let hi = upper.map(|b| number(b.value)).unwrap_or(Value::Null);
                json!({ field.as_str(): { "BETWEEN": [lo, hi] } })
            }
            FilterExpr::Not(inner) => json!({ "NOT": inner.to_json() }),
            FilterExpr::And(clauses) => {
                json!({ "AND": clauses.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
            FilterExpr::Or(clauses) => {
                json!({ "OR": clauses.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
        }
    }
}

impl FromStr for FilterExpr {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_filter(s)
    }
}

/// Whole numbers render as JSON integers so `year > 2000` stays `2000`.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Parse a filter string into an expression tree.
pub fn parse_filter(input: &str) -> Result<FilterExpr, FilterParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FilterParseError {
            position: 0,
            message: "empty filter".to_string(),
        });
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_filter()?;
    if let Some(tok) = parser.peek() {
        return Err(parser.error_at(tok.offset, format!("unexpected {}", tok.kind)));
    }
    Ok(expr)
}

// ═══════════════════════════════════════════════════════════════════════
// Lexer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
    Colon,
    Minus,
    Plus,
    Star,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "'{}'", s),
            TokenKind::Str(s) => write!(f, "string \"{}\"", s),
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Op(op) => write!(f, "'{}'", op),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Colon => f.write_str("':'"),
            TokenKind::Minus => f.write_str("'-'"),
            TokenKind::Plus => f.write_str("'+'"),
            TokenKind::Star => f.write_str("'*'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => single(&mut chars, TokenKind::LParen),
            ')' => single(&mut chars, TokenKind::RParen),
            ',' => single(&mut chars, TokenKind::Comma),
            ':' => single(&mut chars, TokenKind::Colon),
            '-' => single(&mut chars, TokenKind::Minus),
            '+' => single(&mut chars, TokenKind::Plus),
            '*' => single(&mut chars, TokenKind::Star),
            '=' => single(&mut chars, TokenKind::Op(CompareOp::Eq)),
            '<' | '>' => {
                chars.next();
                let or_equal = matches!(chars.peek(), Some((_, '=')));
                if or_equal {
                    chars.next();
                }
                TokenKind::Op(match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                })
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(FilterParseError {
                        position: offset,
                        message: "unterminated string literal".to_string(),
                    });
                }
                TokenKind::Str(value)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                let mut seen_dot = false;
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_digit() || (ch == '.' && !seen_dot) {
                        seen_dot |= ch == '.';
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text.parse::<f64>().map_err(|_| FilterParseError {
                    position: offset,
                    message: format!("invalid number '{}'", text),
                })?;
                TokenKind::Number(value)
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut text = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(text)
            }
            other => {
                return Err(FilterParseError {
                    position: offset,
                    message: format!("unexpected character '{}'", other),
                })
            }
        };
        tokens.push(Token { kind, offset });
    }

    Ok(tokens)
}

fn single(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    kind: TokenKind,
) -> TokenKind {
    chars.next();
    kind
}

// ═══════════════════════════════════════════════════════════════════════
// Parser
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, PartialEq)]
enum Logical {
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn error_at(&self, position: usize, message: String) -> FilterParseError {
        FilterParseError { position, message }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), FilterParseError> {
        let offset = self.offset();
        match self.next() {
            Some(tok) if tok.kind == expected => Ok(()),
            Some(tok) => Err(self.error_at(offset, format!("expected {}, found {}", expected, tok.kind))),
            None => Err(self.error_at(offset, format!("expected {}, found end of input", expected))),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Ident(s)) if s == word)
    }

    fn parse_filter(&mut self) -> Result<FilterExpr, FilterParseError> {
        let mut expr = self.parse_term()?;
        let mut current: Option<Logical> = None;

        loop {
            let op = if self.is_keyword("AND") {
                Logical::And
            } else if self.is_keyword("OR") {
                Logical::Or
            } else {
                break;
            };
            self.next();
            let rhs = self.parse_term()?;

            expr = match (current, op, expr) {
                (Some(Logical::And), Logical::And, FilterExpr::And(mut clauses)) => {
                    clauses.push(rhs);
                    FilterExpr::And(clauses)
                }
                (Some(Logical::Or), Logical::Or, FilterExpr::Or(mut clauses)) => {
                    clauses.push(rhs);
                    FilterExpr::Or(clauses)
                }
                (_, Logical::And, lhs) => FilterExpr::And(vec![lhs, rhs]),
                (_, Logical::Or, lhs) => FilterExpr::Or(vec![lhs, rhs]),
            };
            current = Some(op);
        }

        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<FilterExpr, FilterParseError> {
        let negated = if matches!(self.peek_kind(), Some(TokenKind::Minus)) || self.is_keyword("NOT") {
            self.next();
            true
        } else {
            false
        };

        let expr = if matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            self.next();
            let inner = self.parse_filter()?;
            self.expect(TokenKind::RParen)?;
            inner
        } else {
            self.parse_simple()?
        };

        Ok(if negated {
            FilterExpr::Not(Box::new(expr))
        } else {
            expr
        })
    }

    fn parse_simple(&mut self) -> Result<FilterExpr, FilterParseError> {
        let offset = self.offset();
        let field = match self.next() {
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => name,
            Some(tok) => return Err(self.error_at(offset, format!("expected field name, found {}", tok.kind))),
            None => return Err(self.error_at(offset, "expected field name, found end of input".to_string())),
        };

        let offset = self.offset();
        match self.next().map(|t| t.kind) {
            Some(TokenKind::Op(op)) => {
                let value = self.parse_number()?;
                Ok(FilterExpr::Compare { field, op, value })
            }
            Some(TokenKind::Colon) => {
                let offset = self.offset();
                match self.next().map(|t| t.kind) {
                    Some(TokenKind::Ident(kw)) if kw == "ANY" => self.parse_any(field),
                    Some(TokenKind::Ident(kw)) if kw == "IN" => self.parse_range(field),
                    Some(other) => Err(self.error_at(offset, format!("expected ANY or IN, found {}", other))),
                    None => Err(self.error_at(offset, "expected ANY or IN, found end of input".to_string())),
                }
            }
            Some(other) => Err(self.error_at(
                offset,
                format!("expected ':' or a comparison after field '{}', found {}", field, other),
            )),
            None => Err(self.error_at(offset, format!("incomplete expression for field '{}'", field))),
        }
    }

    fn parse_any(&mut self, field: String) -> Result<FilterExpr, FilterParseError> {
        self.expect(TokenKind::LParen)?;
        let mut values = Vec::new();
        loop {
            let offset = self.offset();
            match self.next().map(|t| t.kind) {
                Some(TokenKind::Str(s)) => values.push(s),
                Some(other) => return Err(self.error_at(offset, format!("expected string literal, found {}", other))),
                None => return Err(self.error_at(offset, "expected string literal, found end of input".to_string())),
            }
            if matches!(self.peek_kind(), Some(TokenKind::Comma)) {
                self.next();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(FilterExpr::AnyOf { field, values })
    }

    fn parse_range(&mut self, field: String) -> Result<FilterExpr, FilterParseError> {
        self.expect(TokenKind::LParen)?;
        let lower = self.parse_bound(true)?;
        self.expect(TokenKind::Comma)?;
        let upper = self.parse_bound(false)?;
        self.expect(TokenKind::RParen)?;
        Ok(FilterExpr::Range {
            field,
            lower,
            upper,
        })
    }

    fn parse_bound(&mut self, is_lower: bool) -> Result<Option<Bound>, FilterParseError> {
        if matches!(self.peek_kind(), Some(TokenKind::Star)) {
            self.next();
            return Ok(None);
        }
        let value = self.parse_number()?;
        let inclusive = match self.peek_kind() {
            Some(TokenKind::Ident(s)) if s == "i" => {
                self.next();
                true
            }
            Some(TokenKind::Ident(s)) if s == "e" => {
                self.next();
                false
            }
            _ => is_lower,
        };
        Ok(Some(Bound { value, inclusive }))
    }

    fn parse_number(&mut self) -> Result<f64, FilterParseError> {
        let sign = match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.next();
                -1.0
            }
            Some(TokenKind::Plus) => {
                self.next();
                1.0
            }
            _ => 1.0,
        };
        let offset = self.offset();
        match self.next().map(|t| t.kind) {
            Some(TokenKind::Number(n)) => Ok(sign * n),
            Some(other) => Err(self.error_at(offset, format!("expected number, found {}", other))),
            None => Err(self.error_at(offset, "expected number, found end of input".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_and_compare() {
        let expr = parse_filter(r#"genre:ANY("comedy","drama") AND year > 2000"#).unwrap();
        assert_eq!(
            expr,
            FilterExpr::And(vec![
                FilterExpr::AnyOf {
                    field: "genre".into(),
                    values: vec!["comedy".into(), "drama".into()],
                },
                FilterExpr::Compare {
                    field: "year".into(),
                    op: CompareOp::Gt,
                    value: 2000.0,
                },
            ])
        );
        assert_eq!(
            expr.to_json(),
            json!({"AND": [{"genre": {"IN": ["comedy", "drama"]}}, {"year": {">": 2000}}]})
        );
    }

    #[test]
    fn test_range_bounds() {
        let expr = parse_filter("price:IN(1.5i, *)").unwrap();
        assert_eq!(
            expr,
            FilterExpr::Range {
                field: "price".into(),
                lower: Some(Bound {
                    value: 1.5,
                    inclusive: true
                }),
                upper: None,
            }
        );
        assert_eq!(expr.to_json(), json!({"price": {"BETWEEN": [1.5, null]}}));

        let expr = parse_filter("score:IN(*, 10i)").unwrap();
        match expr {
            FilterExpr::Range { lower, upper, .. } => {
                assert!(lower.is_none());
                assert!(upper.unwrap().inclusive);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_bound_inclusivity() {
        match parse_filter("n:IN(1, 5)").unwrap() {
            FilterExpr::Range { lower, upper, .. } => {
                assert!(lower.unwrap().inclusive);
                assert!(!upper.unwrap().inclusive);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negation_forms() {
        let dash = parse_filter(r#"-lang:ANY("en")"#).unwrap();
        let word = parse_filter(r#"NOT lang:ANY("en")"#).unwrap();
        assert_eq!(dash, word);
        assert!(matches!(dash, FilterExpr::Not(_)));
        assert_eq!(dash.to_json(), json!({"NOT": {"lang": {"IN": ["en"]}}}));
    }

    #[test]
    fn test_negative_number() {
        let expr = parse_filter("temp <= -3.5").unwrap();
        assert_eq!(expr.to_json(), json!({"temp": {"<=": -3.5}}));
    }

    #[test]
    fn test_left_assoc_flat_chaining() {
        let expr = parse_filter("a > 1 AND b > 2 AND c > 3 OR d > 4").unwrap();
        match expr {
            FilterExpr::Or(clauses) => {
                assert_eq!(clauses.len(), 2);
                match &clauses[0] {
                    FilterExpr::And(inner) => assert_eq!(inner.len(), 3),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parentheses_group() {
        let expr = parse_filter("a > 1 AND (b = 2 OR c < 3)").unwrap();
        match expr {
            FilterExpr::And(clauses) => assert!(matches!(clauses[1], FilterExpr::Or(_))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_filters() {
        for bad in [
            "",
            "genre:ANY(comedy)",
            r#"genre:ANY("comedy""#,
            "year >",
            "year 2000",
            "a > 1 AND",
            "(a > 1",
            "a > 1 b > 2",
            r#"genre:ALL("x")"#,
            "price:IN(1 5)",
            "a ! 3",
        ] {
            assert!(parse_filter(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn test_error_reports_offset() {
        let err = parse_filter("year > 2000 AND ?").unwrap_err();
        assert_eq!(err.position, 16);
    }
}
