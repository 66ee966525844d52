//! Query model, canonical rendering and the text syntax.
//!
//! ```text
//! SELECT ?s ?r WHERE { ?s a <ex:Sensor> . ?s <ex:reading> ?r } FILTER(?r > 10) LIMIT 5
//! ```
//!
//! `a` is shorthand for `rdf:type`. Bare names (`ex:Sensor`) and `<...>` both
//! denote resources. The canonical rendering (`Display`) always uses `<...>`
//! and single spaces and lists filters in sorted order, so it doubles as the
//! normalized cache key. Pattern order is kept: it decides row order.

use crate::term::{Iri, Value, Vocab};
use agentmesh_core::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Var(String),
    Const(Value),
}

pub fn var(name: &str) -> Term {
    Term::Var(name.trim_start_matches('?').to_string())
}

pub fn iri(name: &str) -> Term {
    Term::Const(Value::Ref(Iri::new(name)))
}

pub fn lit(value: impl Into<Value>) -> Term {
    Term::Const(value.into())
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(v) => write!(f, "?{}", v),
            Self::Const(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    pub fn holds(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Eq => left == right || left.compare(right) == Some(Equal),
            Self::Ne => !(left == right || left.compare(right) == Some(Equal)),
            Self::Lt => left.compare(right) == Some(Less),
            Self::Le => matches!(left.compare(right), Some(Less | Equal)),
            Self::Gt => left.compare(right) == Some(Greater),
            Self::Ge => matches!(left.compare(right), Some(Greater | Equal)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub var: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Projected variables. Empty means every bound variable.
    pub select: Vec<String>,
    pub patterns: Vec<TriplePattern>,
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn select<'a>(vars: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            select: vars
                .into_iter()
                .map(|v| v.trim_start_matches('?').to_string())
                .collect(),
            ..Default::default()
        }
    }

    pub fn pattern(mut self, subject: Term, predicate: Term, object: Term) -> Self {
        self.patterns.push(TriplePattern {
            subject,
            predicate,
            object,
        });
        self
    }

    /// `?subject rdf:type <class>`, including instances of subclasses.
    pub fn instances_of(self, subject: &str, class: &str) -> Self {
        self.pattern(var(subject), iri(Vocab::Type.as_str()), iri(class))
    }

    pub fn filter(mut self, var_name: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            var: var_name.trim_start_matches('?').to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Normalized key used for result caching.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    /// Predicates whose facts can affect this query's result, or `None` when a
    /// pattern leaves the predicate open. Type patterns also depend on the
    /// subclass hierarchy.
    pub fn predicates(&self) -> Option<BTreeSet<Iri>> {
        let mut scope = BTreeSet::new();
        for p in &self.patterns {
            let Term::Const(Value::Ref(predicate)) = &p.predicate else {
                return None;
            };
            if Vocab::Type.matches(predicate) {
                scope.insert(Vocab::SubClassOf.iri());
            }
            scope.insert(predicate.clone());
        }
        Some(scope)
    }

    pub fn parse(text: &str) -> Result<Self, StoreError> {
        Parser::new(text)?.parse_query()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT")?;
        if self.select.is_empty() {
            f.write_str(" *")?;
        }
        for v in &self.select {
            write!(f, " ?{}", v)?;
        }
        f.write_str(" WHERE {")?;
        for (i, p) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(" .")?;
            }
            write!(f, " {} {} {}", p.subject, p.predicate, p.object)?;
        }
        f.write_str(" }")?;
        // filters are a conjunction, so their order is not significant
        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|filter| format!(" FILTER(?{} {} {})", filter.var, filter.op.symbol(), filter.value))
            .collect();
        filters.sort();
        for filter in filters {
            f.write_str(&filter)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

/// One result row: variable name -> typed value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRow(pub BTreeMap<String, Value>);

impl BindingRow {
    pub fn get(&self, var_name: &str) -> Option<&Value> {
        self.0.get(var_name.trim_start_matches('?'))
    }

    pub fn bind(&mut self, var_name: &str, value: Value) {
        self.0.insert(var_name.to_string(), value);
    }

    pub fn vars(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

// ---------------------------------------------------------------------------
// Text syntax
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Var(String),
    Iri(String),
    Str(String),
    Int(i64),
    Float(f64),
    Star,
    Dot,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Op(CompareOp),
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '/' | '#' | '.')
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, StoreError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '{' => tokens.push((start, Token::LBrace)),
            '}' => tokens.push((start, Token::RBrace)),
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            '*' => tokens.push((start, Token::Star)),
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push((start, Token::Dot))
            }
            '=' => tokens.push((start, Token::Op(CompareOp::Eq))),
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                tokens.push((start, Token::Op(CompareOp::Ne)));
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 1;
                    tokens.push((start, Token::Op(CompareOp::Ge)));
                } else {
                    tokens.push((start, Token::Op(CompareOp::Gt)));
                }
            }
            '<' => {
                // `<iri>` when a closing bracket follows before whitespace
                let close = chars[i + 1..]
                    .iter()
                    .take_while(|c| !c.is_whitespace())
                    .position(|c| *c == '>');
                match close {
                    Some(len) if len > 0 => {
                        let iri: String = chars[i + 1..i + 1 + len].iter().collect();
                        i += len + 1;
                        tokens.push((start, Token::Iri(iri)));
                    }
                    _ if chars.get(i + 1) == Some(&'=') => {
                        i += 1;
                        tokens.push((start, Token::Op(CompareOp::Le)));
                    }
                    _ => tokens.push((start, Token::Op(CompareOp::Lt))),
                }
            }
            '?' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                if j == i + 1 {
                    return Err(StoreError::parse(start, "empty variable name"));
                }
                tokens.push((start, Token::Var(chars[i + 1..j].iter().collect())));
                i = j;
                continue;
            }
            '"' => {
                let mut s = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(StoreError::parse(start, "unterminated string")),
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = match chars.get(j + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('r') => '\r',
                                Some('0') => '\0',
                                Some('u') if chars.get(j + 2) == Some(&'{') => {
                                    let end = chars[j + 3..]
                                        .iter()
                                        .position(|c| *c == '}')
                                        .ok_or_else(|| StoreError::parse(j, "bad unicode escape"))?;
                                    let hex: String = chars[j + 3..j + 3 + end].iter().collect();
                                    let ch = u32::from_str_radix(&hex, 16)
                                        .ok()
                                        .and_then(char::from_u32)
                                        .ok_or_else(|| StoreError::parse(j, "bad unicode escape"))?;
                                    s.push(ch);
                                    j += end + 4;
                                    continue;
                                }
                                Some(other) => *other,
                                None => return Err(StoreError::parse(j, "dangling escape")),
                            };
                            s.push(escaped);
                            j += 2;
                        }
                        Some(other) => {
                            s.push(*other);
                            j += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(s)));
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].is_ascii_digit() || matches!(chars[j], '.' | 'e' | 'E' | '-' | '+'))
                {
                    // a trailing '.' followed by whitespace is a pattern separator
                    if chars[j] == '.' && !chars.get(j + 1).is_some_and(|n| n.is_ascii_digit()) {
                        break;
                    }
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let token = if let Ok(n) = text.parse::<i64>() {
                    Token::Int(n)
                } else if let Ok(x) = text.parse::<f64>() {
                    Token::Float(x)
                } else {
                    return Err(StoreError::parse(start, format!("bad number '{}'", text)));
                };
                tokens.push((start, token));
                i = j;
                continue;
            }
            c if is_name_char(c) => {
                let mut j = i;
                while j < chars.len() && is_name_char(chars[j]) {
                    if chars[j] == '.' && !chars.get(j + 1).is_some_and(|n| is_name_char(*n) && *n != '.') {
                        break;
                    }
                    j += 1;
                }
                tokens.push((start, Token::Word(chars[i..j].iter().collect())));
                i = j;
                continue;
            }
            other => {
                return Err(StoreError::parse(start, format!("unexpected '{}'", other)));
            }
        }
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(text: &str) -> Result<Self, StoreError> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
            end: text.len(),
        })
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), StoreError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == expected => Ok(()),
            _ => Err(StoreError::parse(offset, format!("expected {}", what))),
        }
    }

    fn parse_query(mut self) -> Result<Query, StoreError> {
        if !self.keyword("select") {
            return Err(StoreError::parse(self.offset(), "expected SELECT"));
        }
        let mut query = Query::default();
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
        } else {
            while let Some(Token::Var(v)) = self.peek().cloned() {
                self.pos += 1;
                query.select.push(v);
            }
        }
        if !self.keyword("where") {
            return Err(StoreError::parse(self.offset(), "expected WHERE"));
        }
        self.expect(Token::LBrace, "'{'")?;
        loop {
            if self.peek() == Some(&Token::RBrace) {
                self.pos += 1;
                break;
            }
            let subject = self.parse_term(false)?;
            let predicate = self.parse_term(true)?;
            let object = self.parse_term(false)?;
            query.patterns.push(TriplePattern {
                subject,
                predicate,
                object,
            });
            match self.next() {
                Some(Token::Dot) => continue,
                Some(Token::RBrace) => break,
                _ => {
                    return Err(StoreError::parse(
                        self.offset(),
                        "expected '.' or '}' after pattern",
                    ))
                }
            }
        }
        while self.keyword("filter") {
            self.expect(Token::LParen, "'('")?;
            let offset = self.offset();
            let var_name = match self.next() {
                Some(Token::Var(v)) => v,
                _ => return Err(StoreError::parse(offset, "expected variable in FILTER")),
            };
            let offset = self.offset();
            let op = match self.next() {
                Some(Token::Op(op)) => op,
                _ => return Err(StoreError::parse(offset, "expected comparison operator")),
            };
            let offset = self.offset();
            let value = match self.parse_term(false)? {
                Term::Const(v) => v,
                Term::Var(_) => {
                    return Err(StoreError::parse(offset, "FILTER compares against a constant"))
                }
            };
            self.expect(Token::RParen, "')'")?;
            query.filters.push(Filter {
                var: var_name,
                op,
                value,
            });
        }
        if self.keyword("limit") {
            let offset = self.offset();
            match self.next() {
                Some(Token::Int(n)) if n >= 0 => query.limit = Some(n as usize),
                _ => return Err(StoreError::parse(offset, "expected LIMIT count")),
            }
        }
        if self.pos < self.tokens.len() {
            return Err(StoreError::parse(self.offset(), "trailing input"));
        }
        Ok(query)
    }

    fn parse_term(&mut self, predicate_position: bool) -> Result<Term, StoreError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Var(v)) => Ok(Term::Var(v)),
            Some(Token::Iri(s)) => Ok(iri(&s)),
            Some(Token::Str(s)) => Ok(Term::Const(Value::Str(s))),
            Some(Token::Int(n)) => Ok(Term::Const(Value::Int(n))),
            Some(Token::Float(x)) => Ok(Term::Const(Value::Float(x))),
            Some(Token::Word(w)) if predicate_position && w == "a" => Ok(iri(Vocab::Type.as_str())),
            Some(Token::Word(w)) if w == "true" => Ok(Term::Const(Value::Bool(true))),
            Some(Token::Word(w)) if w == "false" => Ok(Term::Const(Value::Bool(false))),
            Some(Token::Word(w)) => Ok(iri(&w)),
            _ => Err(StoreError::parse(offset, "expected term")),
        }
    }
}
