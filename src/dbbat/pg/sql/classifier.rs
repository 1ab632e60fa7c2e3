use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::dbbat::pg::sql::QueryType;

#[derive(Display, EnumString, Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CopyDirection {
    /// COPY ... FROM: data flows from the client to the server
    In,
    /// COPY ... TO: data flows from the server to the client
    Out,
}

#[derive(Display, EnumString, Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CopyFormat {
    Text,
    Csv,
    Binary,
}

#[derive(Debug, Clone)]
pub struct CopyInfo {
    pub direction: CopyDirection,
    pub format: CopyFormat,
    pub columns: Vec<String>,
}

/// The policy-relevant facts about one SQL statement.
#[derive(Debug, Clone)]
pub struct StatementInfo {
    pub query_type: QueryType,
    pub copy: Option<CopyInfo>,
    /// WITH queries get their data-modifying CTE scan folded in here.
    pub is_write: bool,
    /// ALTER USER/ROLE ... PASSWORD ...
    pub password_change: bool,
    /// SET/RESET forms that would defeat session read-only enforcement.
    pub read_only_bypass: bool,
}

impl StatementInfo {
    pub fn is_write(&self) -> bool {
        self.is_write
            || matches!(
                &self.copy,
                Some(CopyInfo {
                    direction: CopyDirection::In,
                    ..
                })
            )
    }

    pub fn is_ddl(&self) -> bool {
        self.query_type.is_ddl()
    }

    pub fn is_dcl(&self) -> bool {
        self.query_type.is_dcl()
    }
}

/// Classify every statement in a (possibly multi-statement) SQL string.
/// Statements whose policy-relevant shape we cannot determine come back as
/// QueryType::Other; session-level default_transaction_read_only remains the
/// authoritative enforcement behind this classifier.
pub fn classify(sql: &str) -> Vec<StatementInfo> {
    split_statements(sql)
        .into_iter()
        .map(classify_statement)
        .collect()
}

/// Extract the column list of a `COPY tbl (a, b, c) ...` statement, for
/// labeling captured COPY rows. Empty when no column list is present.
pub fn copy_columns(sql: &str) -> Vec<String> {
    for stmt in classify(sql) {
        if let Some(copy) = stmt.copy {
            return copy.columns;
        }
    }
    Vec::new()
}

fn classify_statement(stmt: &str) -> StatementInfo {
    let tokens: Vec<Token> = Lexer::new(stmt).take(256).collect();
    let head = head_keywords(&tokens, 6);
    let mut query_type = QueryType::from(head.as_str());

    // SELECT ... INTO is CREATE TABLE AS in disguise; INTO can appear after
    // the select list so the head alone doesn't see it.
    if query_type == QueryType::Select && has_depth0_word(&tokens, &["INTO"]) {
        query_type = QueryType::SelectInto;
    }

    let mut is_write = query_type.is_write();
    // data-modifying CTEs hide inside parens, so scan WITH queries at any
    // depth; the keywords are reserved, a bare occurrence means modification
    if query_type == QueryType::With
        && has_word(&tokens, &["INSERT", "UPDATE", "DELETE", "MERGE"])
    {
        is_write = true;
    }

    let copy = if query_type == QueryType::Copy {
        parse_copy(&tokens)
    } else {
        None
    };

    StatementInfo {
        query_type,
        copy,
        is_write,
        password_change: is_password_change(query_type, &tokens),
        read_only_bypass: is_read_only_bypass(query_type, &tokens),
    }
}

/// Join the first max_words word tokens, uppercased, into the normalized
/// statement head that QueryType matches on.
fn head_keywords(tokens: &[Token], max_words: usize) -> String {
    let mut head = String::new();
    let mut words = 0;
    for tok in tokens {
        match tok {
            Token::Word(w) | Token::QuotedIdent(w) => {
                if !head.is_empty() {
                    head.push(' ');
                }
                head.push_str(&w.to_ascii_uppercase());
                words += 1;
                if words == max_words {
                    break;
                }
            }
            Token::Symbol('=') => {
                if !head.is_empty() {
                    head.push(' ');
                }
                head.push('=');
            }
            _ => break,
        }
    }
    head
}

fn has_word(tokens: &[Token], words: &[&str]) -> bool {
    tokens.iter().any(|tok| match tok {
        Token::Word(w) => words.iter().any(|target| w.eq_ignore_ascii_case(target)),
        _ => false,
    })
}

fn has_depth0_word(tokens: &[Token], words: &[&str]) -> bool {
    let mut depth = 0i32;
    for tok in tokens {
        match tok {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            Token::Word(w) if depth == 0 => {
                if words.iter().any(|target| w.eq_ignore_ascii_case(target)) {
                    return true;
                }
            }
            _ => (),
        }
    }
    false
}

fn is_password_change(query_type: QueryType, tokens: &[Token]) -> bool {
    if query_type != QueryType::Alter {
        return false;
    }
    let target = match tokens.get(1) {
        Some(Token::Word(w)) => w,
        _ => return false,
    };
    if !target.eq_ignore_ascii_case("USER") && !target.eq_ignore_ascii_case("ROLE") {
        return false;
    }
    tokens.iter().any(|tok| match tok {
        Token::Word(w) => w.eq_ignore_ascii_case("PASSWORD"),
        _ => false,
    })
}

fn is_read_only_bypass(query_type: QueryType, tokens: &[Token]) -> bool {
    match query_type {
        QueryType::SetRole => true,
        QueryType::SetSession | QueryType::SetLocal => {
            // SET [SESSION|LOCAL] <var> ...; find the variable name
            let var = tokens.iter().skip(1).find_map(|tok| match tok {
                Token::Word(w)
                    if !w.eq_ignore_ascii_case("SESSION") && !w.eq_ignore_ascii_case("LOCAL") =>
                {
                    Some(w.as_str())
                }
                Token::QuotedIdent(w) => Some(w.as_str()),
                _ => None,
            });
            // session_authorization and role are also settable as plain GUCs
            matches!(var, Some(v) if v.eq_ignore_ascii_case("default_transaction_read_only")
                || v.eq_ignore_ascii_case("transaction_read_only")
                || v.eq_ignore_ascii_case("session_authorization")
                || v.eq_ignore_ascii_case("role"))
        }
        QueryType::SetTransaction => {
            // SET TRANSACTION READ WRITE overrides the read-only default
            tokens
                .windows(2)
                .any(|pair| match (&pair[0], &pair[1]) {
                    (Token::Word(a), Token::Word(b)) => {
                        a.eq_ignore_ascii_case("READ") && b.eq_ignore_ascii_case("WRITE")
                    }
                    _ => false,
                })
        }
        QueryType::Reset => match tokens.get(1) {
            Some(Token::Word(w)) => {
                w.eq_ignore_ascii_case("default_transaction_read_only")
                    || w.eq_ignore_ascii_case("transaction_read_only")
                    || w.eq_ignore_ascii_case("role")
                    || w.eq_ignore_ascii_case("session_authorization")
                    || w.eq_ignore_ascii_case("all")
            }
            Some(Token::QuotedIdent(w)) => {
                w.eq_ignore_ascii_case("default_transaction_read_only")
            }
            _ => false,
        },
        QueryType::Begin => tokens.windows(2).any(|pair| match (&pair[0], &pair[1]) {
            (Token::Word(a), Token::Word(b)) => {
                a.eq_ignore_ascii_case("READ") && b.eq_ignore_ascii_case("WRITE")
            }
            _ => false,
        }),
        _ => false,
    }
}

fn parse_copy(tokens: &[Token]) -> Option<CopyInfo> {
    let mut format = CopyFormat::Text;
    let mut columns = Vec::new();
    let mut direction = None;

    let mut i = 1; // past COPY
    // legacy prefix form: COPY BINARY tbl ...
    if let Some(Token::Word(w)) = tokens.get(i) {
        if w.eq_ignore_ascii_case("BINARY") {
            format = CopyFormat::Binary;
            i += 1;
        }
    }

    // table name or parenthesized query, then optional column list
    let mut depth = 0i32;
    let mut seen_columns = false;
    while let Some(tok) = tokens.get(i) {
        match tok {
            Token::Symbol('(') => {
                depth += 1;
                // a paren directly after the table name is the column list;
                // a paren before any name is the query form COPY (SELECT ...)
                if depth == 1 && i > 1 && !seen_columns {
                    seen_columns = true;
                    i += 1;
                    while let Some(tok) = tokens.get(i) {
                        match tok {
                            Token::Word(w) => columns.push(w.to_ascii_lowercase()),
                            Token::QuotedIdent(w) => columns.push(w.clone()),
                            Token::Symbol(')') => {
                                depth -= 1;
                                break;
                            }
                            _ => (),
                        }
                        i += 1;
                    }
                }
            }
            Token::Symbol(')') => depth -= 1,
            Token::Word(w) if depth == 0 => {
                if w.eq_ignore_ascii_case("FROM") {
                    direction = Some(CopyDirection::In);
                    i += 1;
                    break;
                } else if w.eq_ignore_ascii_case("TO") {
                    direction = Some(CopyDirection::Out);
                    i += 1;
                    break;
                }
            }
            _ => (),
        }
        i += 1;
    }

    // options: WITH (FORMAT csv), legacy CSV / BINARY keywords
    while let Some(tok) = tokens.get(i) {
        if let Token::Word(w) = tok {
            if w.eq_ignore_ascii_case("FORMAT") {
                if let Some(Token::Word(fmt)) = tokens.get(i + 1) {
                    if let Ok(parsed) = fmt.to_ascii_lowercase().parse::<CopyFormat>() {
                        format = parsed;
                    }
                    i += 1;
                }
            } else if w.eq_ignore_ascii_case("CSV") {
                format = CopyFormat::Csv;
            } else if w.eq_ignore_ascii_case("BINARY") {
                format = CopyFormat::Binary;
            }
        }
        i += 1;
    }

    direction.map(|direction| CopyInfo {
        direction,
        format,
        columns,
    })
}

/// Split a SQL string on statement-separating semicolons, skipping string
/// literals, quoted identifiers, dollar quotes and comments. Empty statements
/// are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut lexer = Lexer::new(sql);
    while let Some(tok) = lexer.next() {
        if let Token::Symbol(';') = tok {
            let stmt = sql[start..lexer.last_start()].trim();
            if !stmt.is_empty() {
                out.push(stmt);
            }
            start = lexer.pos();
        }
    }
    let stmt = sql[start..].trim();
    if !stmt.is_empty() {
        out.push(stmt);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    QuotedIdent(String),
    Literal,
    Number,
    Symbol(char),
}

/// A minimal SQL lexer: enough to skip comments, string literals in all their
/// PostgreSQL shapes, and quoted identifiers, and to hand back keywords and
/// punctuation. It never fails; unterminated constructs run to end of input.
struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    last_start: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            last_start: 0,
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    /// Byte offset where the most recently returned token started.
    fn last_start(&self) -> usize {
        self.last_start
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes().get(self.pos + offset).cloned()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek_at(0) {
                Some(c) if (c as char).is_whitespace() => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    // line comment
                    self.pos += 2;
                    while let Some(c) = self.peek_at(0) {
                        self.pos += 1;
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    // block comment, nested per the SQL standard
                    self.pos += 2;
                    let mut level = 1;
                    while level > 0 {
                        match (self.peek_at(0), self.peek_at(1)) {
                            (Some(b'/'), Some(b'*')) => {
                                level += 1;
                                self.pos += 2;
                            }
                            (Some(b'*'), Some(b'/')) => {
                                level -= 1;
                                self.pos += 2;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => return,
                        }
                    }
                }
                _ => return,
            }
        }
    }

    /// Consume a '...'-style literal starting at the opening quote.
    /// Doubled quotes always continue the string; backslash escapes do when
    /// escape_backslash is set (E'...' strings).
    fn consume_single_quoted(&mut self, escape_backslash: bool) {
        self.pos += 1;
        while let Some(c) = self.peek_at(0) {
            self.pos += 1;
            match c {
                b'\\' if escape_backslash => {
                    if self.peek_at(0).is_some() {
                        self.pos += 1;
                    }
                }
                b'\'' => {
                    if self.peek_at(0) == Some(b'\'') {
                        self.pos += 1; // escaped quote
                    } else {
                        return;
                    }
                }
                _ => (),
            }
        }
    }

    /// Consume a $tag$...$tag$ literal if one starts here; returns false if
    /// the '$' is something else (a parameter placeholder).
    fn consume_dollar_quoted(&mut self) -> bool {
        let bytes = self.bytes();
        let mut end = self.pos + 1;
        while end < bytes.len() {
            let c = bytes[end];
            if c == b'$' {
                break;
            }
            if !(c as char).is_ascii_alphanumeric() && c != b'_' {
                return false;
            }
            end += 1;
        }
        if end >= bytes.len() {
            return false;
        }
        let delim = &self.src[self.pos..=end];
        let body_start = end + 1;
        match self.src[body_start..].find(delim) {
            Some(i) => self.pos = body_start + i + delim.len(),
            None => self.pos = self.src.len(), // unterminated
        }
        true
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.skip_whitespace_and_comments();
        self.last_start = self.pos;
        let c = self.peek_at(0)?;
        match c {
            b'\'' => {
                self.consume_single_quoted(false);
                Some(Token::Literal)
            }
            b'"' => {
                self.pos += 1;
                let mut ident = Vec::new();
                while let Some(c) = self.peek_at(0) {
                    self.pos += 1;
                    if c == b'"' {
                        if self.peek_at(0) == Some(b'"') {
                            ident.push(b'"');
                            self.pos += 1;
                        } else {
                            break;
                        }
                    } else {
                        ident.push(c);
                    }
                }
                Some(Token::QuotedIdent(
                    String::from_utf8_lossy(&ident).into_owned(),
                ))
            }
            b'$' => {
                if self.consume_dollar_quoted() {
                    Some(Token::Literal)
                } else {
                    // parameter placeholder like $1
                    self.pos += 1;
                    while let Some(c) = self.peek_at(0) {
                        if (c as char).is_ascii_digit() {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                    Some(Token::Number)
                }
            }
            b'0'..=b'9' => {
                while let Some(c) = self.peek_at(0) {
                    if (c as char).is_ascii_alphanumeric() || c == b'.' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Some(Token::Number)
            }
            c if (c as char).is_ascii_alphabetic() || c == b'_' || c >= 0x80 => {
                let start = self.pos;
                while let Some(c) = self.peek_at(0) {
                    if (c as char).is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80 {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let word = &self.src[start..self.pos];
                // string literal prefixes: E'...', B'...', X'...', U&'...'
                if self.peek_at(0) == Some(b'\'') && word.len() == 1 {
                    match word.as_bytes()[0] {
                        b'E' | b'e' => {
                            self.consume_single_quoted(true);
                            return Some(Token::Literal);
                        }
                        b'B' | b'b' | b'X' | b'x' => {
                            self.consume_single_quoted(false);
                            return Some(Token::Literal);
                        }
                        _ => (),
                    }
                } else if (word == "U" || word == "u")
                    && self.peek_at(0) == Some(b'&')
                    && self.peek_at(1) == Some(b'\'')
                {
                    self.pos += 1;
                    self.consume_single_quoted(false);
                    return Some(Token::Literal);
                }
                Some(Token::Word(word.to_string()))
            }
            _ => {
                self.pos += 1;
                Some(Token::Symbol(c as char))
            }
        }
    }
}
