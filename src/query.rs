//! Filter predicate parsing.
//!
//! Grammar: `column op literal` clauses joined by `and` / `or`, with
//! parentheses for grouping. Operators: `= == != > >= < <= like`. `like`
//! takes a regular expression, validated before it reaches the engine.
//! Compiles to a Polars `Expr`; the predicate evaluates to a boolean per row.

use polars::prelude::*;

use crate::error::{DbvError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Number(f64),
    String(String),
    Op(String),
    And,
    Or,
    Like,
    LParen,
    RParen,
    True,
    False,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '=' | '!' | '<' | '>' => {
                let mut op = String::new();
                op.push(c);
                chars.next();
                if chars.peek() == Some(&'=') {
                    op.push('=');
                    chars.next();
                }
                if op == "!" {
                    return Err(DbvError::Validation("lone '!' is not an operator".into()));
                }
                tokens.push(Token::Op(op));
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(DbvError::Validation("unterminated string literal".into()))
                        }
                    }
                }
                tokens.push(Token::String(s));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || ch == '_' {
                        num.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num = num.replace('_', "");
                let value: f64 = num
                    .parse()
                    .map_err(|_| DbvError::Validation(format!("bad number: {num}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "like" => tokens.push(Token::Like),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Identifier(word)),
                }
            }
            other => {
                return Err(DbvError::Validation(format!(
                    "unexpected character '{other}'"
                )))
            }
        }
    }

    Ok(tokens)
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// expr := clause (("and" | "or") clause)*, left associative.
    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.clause()?;
        while let Some(tok) = self.peek() {
            match tok {
                Token::And => {
                    self.next();
                    left = left.and(self.clause()?);
                }
                Token::Or => {
                    self.next();
                    left = left.or(self.clause()?);
                }
                Token::RParen => break,
                other => {
                    return Err(DbvError::Validation(format!(
                        "expected 'and' or 'or', found {other:?}"
                    )))
                }
            }
        }
        Ok(left)
    }

    /// clause := "(" expr ")" | ident op literal
    fn clause(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DbvError::Validation("missing closing ')'".into())),
                }
            }
            Some(Token::Identifier(name)) => self.comparison(name),
            other => Err(DbvError::Validation(format!(
                "expected column name, found {other:?}"
            ))),
        }
    }

    fn comparison(&mut self, column: String) -> Result<Expr> {
        let lhs = col(column.as_str());
        match self.next() {
            Some(Token::Op(op)) => {
                let rhs = self.literal()?;
                let expr = match op.as_str() {
                    "=" | "==" => lhs.eq(rhs),
                    "!=" => lhs.neq(rhs),
                    ">" => lhs.gt(rhs),
                    ">=" => lhs.gt_eq(rhs),
                    "<" => lhs.lt(rhs),
                    "<=" => lhs.lt_eq(rhs),
                    other => {
                        return Err(DbvError::Validation(format!("unknown operator '{other}'")))
                    }
                };
                Ok(expr)
            }
            Some(Token::Like) => {
                let pattern = match self.next() {
                    Some(Token::String(s)) => s,
                    other => {
                        return Err(DbvError::Validation(format!(
                            "'like' needs a quoted pattern, found {other:?}"
                        )))
                    }
                };
                // Fail fast on a bad pattern instead of erroring mid-scan.
                regex::Regex::new(&pattern)
                    .map_err(|e| DbvError::Validation(format!("bad 'like' pattern: {e}")))?;
                Ok(lhs.str().contains(lit(pattern), true))
            }
            other => Err(DbvError::Validation(format!(
                "expected comparison operator after '{column}', found {other:?}"
            ))),
        }
    }

    fn literal(&mut self) -> Result<Expr> {
        match self.next() {
            // Integral literals stay integers so integer columns compare
            // without a float cast.
            Some(Token::Number(n)) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                Ok(lit(n as i64))
            }
            Some(Token::Number(n)) => Ok(lit(n)),
            Some(Token::String(s)) => Ok(lit(s)),
            Some(Token::True) => Ok(lit(true)),
            Some(Token::False) => Ok(lit(false)),
            other => Err(DbvError::Validation(format!(
                "expected literal value, found {other:?}"
            ))),
        }
    }
}

/// Parse a filter predicate into a Polars expression.
pub fn parse_predicate(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(DbvError::Validation("empty predicate".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(DbvError::Validation(
            "trailing input after predicate".into(),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(df: &DataFrame, predicate: &str) -> DataFrame {
        let expr = parse_predicate(predicate).unwrap();
        df.clone().lazy().filter(expr).collect().unwrap()
    }

    fn sample() -> DataFrame {
        df!(
            "a" => [1i64, 5, 10, 50, 100],
            "name" => ["alpha", "beta", "gamma", "delta", "alphabet"],
            "flag" => [true, false, true, false, true],
        )
        .unwrap()
    }

    #[test]
    fn numeric_comparison() {
        let out = apply(&sample(), "a > 5");
        assert_eq!(out.height(), 3);
        let out = apply(&sample(), "a <= 5");
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn string_equality_and_boolean() {
        let out = apply(&sample(), "name = 'beta'");
        assert_eq!(out.height(), 1);
        let out = apply(&sample(), "flag = true");
        assert_eq!(out.height(), 3);
    }

    #[test]
    fn conjunction_and_grouping() {
        let out = apply(&sample(), "a > 1 and a < 100");
        assert_eq!(out.height(), 3);
        let out = apply(&sample(), "(a = 1 or a = 100) and flag = true");
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn like_matches_regex() {
        let out = apply(&sample(), "name like '^alpha'");
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn malformed_predicates_fail_validation() {
        for bad in [
            "",
            "a >",
            "> 5",
            "a ! 5",
            "a > 5 and",
            "a like '['",
            "name = 'unterminated",
            "a > 5 b < 3",
            "(a > 5",
        ] {
            let err = parse_predicate(bad).unwrap_err();
            assert!(matches!(err, DbvError::Validation(_)), "input: {bad}");
        }
    }
}
