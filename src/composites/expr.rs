//! Composite expression parsing.
//!
//! The grammar accepted here matches the composite rule bodies loaded from
//! configuration and map files:
//!
//! ```text
//! expr   := term (('&'|'&&') term)* | term (('|'|'||') term)*
//! term   := atom | '!' term | '(' expr ')' | term op number
//! atom   := modifiers? identifier (':' suboption)?
//! ```
//!
//! Atom modifiers: `~` protects the named symbol from removal, `-` withholds
//! the composite score on match, `^` forces second-pass classification.
//! `g:NAME` / `gr:NAME` atoms evaluate over the symbol group `NAME`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {at}")]
    UnexpectedChar { ch: char, at: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token at offset {at}")]
    UnexpectedToken { at: usize },

    #[error("expected a number at offset {at}")]
    ExpectedNumber { at: usize },

    #[error("trailing input at offset {at}")]
    TrailingInput { at: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl CmpOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

/// A leaf reference to a symbol, a group, or another composite.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub name: String,
    pub suboption: Option<String>,
    /// `~`: never remove the referenced symbol, whatever the policy says.
    pub protected: bool,
    /// `-`: suppress the composite's own score when this atom matches.
    pub no_score: bool,
    /// `^`: forward reference, forces the composite into the second pass.
    pub forward: bool,
    /// `g:NAME` / `gr:NAME`
    pub group: Option<String>,
}

impl Atom {
    fn named(name: String) -> Atom {
        Atom {
            name,
            suboption: None,
            protected: false,
            no_score: false,
            forward: false,
            group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Atom(Atom),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: f64,
    },
    Plus(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, f64),
}

impl Expr {
    /// All leaf atoms of the expression, in source order.
    pub fn atoms(&self) -> Vec<&Atom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a Atom>) {
        match self {
            Expr::Atom(a) => out.push(a),
            Expr::Not(x) | Expr::Mul(x, _) => x.collect_atoms(out),
            Expr::Cmp { lhs, .. } => lhs.collect_atoms(out),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Plus(l, r) => {
                l.collect_atoms(out);
                r.collect_atoms(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(Atom),
    Number(f64),
    And,
    Or,
    Not,
    LParen,
    RParen,
    Plus,
    Star,
    Cmp(CmpOp),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_suboption_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let at = i;
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '&' => {
                i += if chars.get(i + 1) == Some(&'&') { 2 } else { 1 };
                tokens.push((Token::And, at));
            }
            '|' => {
                i += if chars.get(i + 1) == Some(&'|') { 2 } else { 1 };
                tokens.push((Token::Or, at));
            }
            '!' => {
                i += 1;
                tokens.push((Token::Not, at));
            }
            '(' => {
                i += 1;
                tokens.push((Token::LParen, at));
            }
            ')' => {
                i += 1;
                tokens.push((Token::RParen, at));
            }
            '+' => {
                i += 1;
                tokens.push((Token::Plus, at));
            }
            '*' => {
                i += 1;
                tokens.push((Token::Star, at));
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    tokens.push((Token::Cmp(CmpOp::Ge), at));
                } else {
                    i += 1;
                    tokens.push((Token::Cmp(CmpOp::Gt), at));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    tokens.push((Token::Cmp(CmpOp::Le), at));
                } else {
                    i += 1;
                    tokens.push((Token::Cmp(CmpOp::Lt), at));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    tokens.push((Token::Cmp(CmpOp::Eq), at));
                } else {
                    return Err(ExprError::UnexpectedChar { ch: '=', at });
                }
            }
            '-' if chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) => {
                let (num, next) = lex_number(&chars, i)?;
                tokens.push((Token::Number(num), at));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (num, next) = lex_number(&chars, i)?;
                tokens.push((Token::Number(num), at));
                i = next;
            }
            '~' | '-' | '^' => {
                let (atom, next) = lex_atom(&chars, i)?;
                tokens.push((Token::Atom(atom), at));
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (atom, next) = lex_atom(&chars, i)?;
                tokens.push((Token::Atom(atom), at));
                i = next;
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, at }),
        }
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), ExprError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| ExprError::ExpectedNumber { at: start })
}

fn lex_atom(chars: &[char], start: usize) -> Result<(Atom, usize), ExprError> {
    let mut i = start;
    let mut protected = false;
    let mut no_score = false;
    let mut forward = false;

    while i < chars.len() {
        match chars[i] {
            '~' => protected = true,
            '-' => no_score = true,
            '^' => forward = true,
            _ => break,
        }
        i += 1;
    }

    let ident_start = i;
    while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
    }
    if ident_start == i {
        return Err(ExprError::UnexpectedChar {
            ch: *chars.get(i).unwrap_or(&' '),
            at: i.min(chars.len().saturating_sub(1)),
        });
    }
    let ident: String = chars[ident_start..i].iter().collect();

    let mut atom = Atom::named(ident);
    atom.protected = protected;
    atom.no_score = no_score;
    atom.forward = forward;

    if i < chars.len() && chars[i] == ':' {
        i += 1;
        let sub_start = i;
        while i < chars.len() && is_suboption_char(chars[i]) {
            i += 1;
        }
        if sub_start == i {
            return Err(ExprError::UnexpectedChar {
                ch: *chars.get(i).unwrap_or(&':'),
                at: i.min(chars.len().saturating_sub(1)),
            });
        }
        let tail: String = chars[sub_start..i].iter().collect();
        if atom.name == "g" || atom.name == "gr" {
            atom.group = Some(tail);
            atom.name = String::new();
        } else {
            atom.suboption = Some(tail);
        }
    }

    Ok((atom, i))
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn at(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, at)| *at)
            .unwrap_or(usize::MAX)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_arith()?;
        if let Some(&Token::Cmp(op)) = self.peek() {
            self.advance();
            let at = self.at();
            match self.advance() {
                Some(Token::Number(rhs)) => {
                    return Ok(Expr::Cmp {
                        op,
                        lhs: Box::new(lhs),
                        rhs,
                    })
                }
                Some(_) => return Err(ExprError::ExpectedNumber { at }),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
        Ok(lhs)
    }

    fn parse_arith(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Plus(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Star) => {
                    self.advance();
                    let at = self.at();
                    match self.advance() {
                        Some(Token::Number(factor)) => {
                            lhs = Expr::Mul(Box::new(lhs), factor);
                        }
                        Some(_) => return Err(ExprError::ExpectedNumber { at }),
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let at = self.at();
        match self.advance() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_term()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(_) => Err(ExprError::UnexpectedToken { at: self.at() }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(Token::Atom(atom)) => Ok(Expr::Atom(atom)),
            Some(_) => Err(ExprError::UnexpectedToken { at }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

/// Parse a composite expression.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::TrailingInput { at: parser.at() });
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(name: &str) -> Expr {
        Expr::Atom(Atom::named(name.to_string()))
    }

    #[test]
    fn test_parse_simple_and() {
        let expr = parse("A & B").unwrap();
        assert_eq!(
            expr,
            Expr::And(Box::new(atom("A")), Box::new(atom("B")))
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("A | B & C").unwrap();
        match expr {
            Expr::Or(l, r) => {
                assert_eq!(*l, atom("A"));
                assert!(matches!(*r, Expr::And(_, _)));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_double_operators_accepted() {
        assert_eq!(parse("A && B").unwrap(), parse("A & B").unwrap());
        assert_eq!(parse("A || B").unwrap(), parse("A | B").unwrap());
    }

    #[test]
    fn test_not_and_parens() {
        let expr = parse("!(A | B) & C").unwrap();
        match expr {
            Expr::And(l, _) => assert!(matches!(*l, Expr::Not(_))),
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn test_modifiers() {
        let expr = parse("~A & -B & ^C").unwrap();
        let atoms = expr.atoms();
        assert!(atoms[0].protected);
        assert!(atoms[1].no_score);
        assert!(atoms[2].forward);
        assert_eq!(atoms[1].name, "B");
    }

    #[test]
    fn test_group_atom() {
        let expr = parse("g:fuzzy & X").unwrap();
        let atoms = expr.atoms();
        assert_eq!(atoms[0].group.as_deref(), Some("fuzzy"));
        assert_eq!(parse("gr:spam").unwrap().atoms()[0].group.as_deref(), Some("spam"));
    }

    #[test]
    fn test_suboption() {
        let expr = parse("DKIM_ALLOW:example.com & X").unwrap();
        let atoms = expr.atoms();
        assert_eq!(atoms[0].name, "DKIM_ALLOW");
        assert_eq!(atoms[0].suboption.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_comparison_and_arithmetic() {
        let expr = parse("A + B + C > 2").unwrap();
        match expr {
            Expr::Cmp { op, lhs, rhs } => {
                assert_eq!(op, CmpOp::Gt);
                assert_eq!(rhs, 2.0);
                assert_eq!(lhs.atoms().len(), 3);
            }
            other => panic!("unexpected tree: {other:?}"),
        }

        let expr = parse("A * 2.5 >= -1").unwrap();
        assert!(matches!(expr, Expr::Cmp { op: CmpOp::Ge, .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("A &"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(parse("(A"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(parse("A > B"), Err(ExprError::ExpectedNumber { .. })));
        assert!(matches!(parse(""), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(parse("A ; B"), Err(ExprError::UnexpectedChar { .. })));
        assert!(matches!(parse("A B"), Err(ExprError::TrailingInput { .. })));
    }
}
