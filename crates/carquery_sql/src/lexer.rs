//! SQL tokenizer and canonical token rendering.
//!
//! Comments are dropped, literals are kept whole so keyword scans never look
//! inside them. Rendering a token slice always produces the same spacing, which
//! is what makes repaired SQL stable under a second pass.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    QuotedIdent,
    StringLit,
    Number,
    Op,
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn word(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Word, text)
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_any_keyword(&self, keywords: &[&str]) -> bool {
        self.kind == TokenKind::Word && keywords.iter().any(|k| self.text.eq_ignore_ascii_case(k))
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    /// Identifier name for words and quoted identifiers, without quotes.
    pub fn ident_name(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.clone()),
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len().saturating_sub(1)];
                let quote = &self.text[..1];
                Some(inner.replace(&format!("{quote}{quote}"), quote))
            }
            _ => None,
        }
    }

    /// True for a word that is not a reserved keyword, or a quoted identifier.
    pub fn is_identifier(&self) -> bool {
        match self.kind {
            TokenKind::Word => !is_reserved(&self.text),
            TokenKind::QuotedIdent => true,
            _ => false,
        }
    }
}

/// Keywords that can never be a column or alias name in the accepted grammar.
const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "COLLATE", "CROSS", "DESC", "DISTINCT",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "FALSE", "FIRST", "FROM", "FULL", "GLOB",
    "GROUP", "HAVING", "IN", "INNER", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "LAST",
    "LEFT", "LIKE", "LIMIT", "NATURAL", "NOT", "NOTNULL", "NULL", "NULLS", "OFFSET", "ON", "OR",
    "ORDER", "OUTER", "REGEXP", "RIGHT", "SELECT", "THEN", "TRUE", "UNION", "USING", "VALUES",
    "WHEN", "WHERE", "WITH",
];

pub fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| word.eq_ignore_ascii_case(k))
}

/// Words after which `(` opens a grouping, not a function call.
const SPACED_BEFORE_PAREN: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "BETWEEN", "BY", "CASE", "DISTINCT", "ELSE", "EXISTS", "FROM",
    "HAVING", "IN", "IS", "JOIN", "LIKE", "LIMIT", "NOT", "OFFSET", "ON", "OR", "SELECT",
    "SOME", "THEN", "UNION", "USING", "VALUES", "WHEN", "WHERE",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at byte {offset}")]
pub struct LexError {
    pub message: String,
    pub offset: usize,
}

/// Tokens produced before any error, plus the error itself.
#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    pub error: Option<LexError>,
}

impl Lexed {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

pub fn tokenize(sql: &str) -> Lexed {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut i = 0;

    let fail = |tokens: Vec<Token>, message: &str, offset: usize| Lexed {
        tokens,
        error: Some(LexError {
            message: message.to_string(),
            offset,
        }),
    };

    while i < chars.len() {
        let (offset, ch) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if ch == '-' && next == Some('-') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        if ch == '/' && next == Some('*') {
            i += 2;
            let mut closed = false;
            while i < chars.len() {
                if chars[i].1 == '*' && chars.get(i + 1).map(|(_, c)| *c) == Some('/') {
                    i += 2;
                    closed = true;
                    break;
                }
                i += 1;
            }
            if !closed {
                return fail(tokens, "Unterminated block comment", offset);
            }
            continue;
        }

        if ch == '\'' || ch == '"' || ch == '`' {
            let kind = if ch == '\'' {
                TokenKind::StringLit
            } else {
                TokenKind::QuotedIdent
            };
            let mut text = String::new();
            text.push(ch);
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let c = chars[i].1;
                text.push(c);
                i += 1;
                if c == ch {
                    if i < chars.len() && chars[i].1 == ch {
                        text.push(ch);
                        i += 1;
                        continue;
                    }
                    closed = true;
                    break;
                }
            }
            if !closed {
                let message = if kind == TokenKind::StringLit {
                    "Unterminated string literal"
                } else {
                    "Unterminated quoted identifier"
                };
                return fail(tokens, message, offset);
            }
            tokens.push(Token::new(kind, text));
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && next.is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            let mut seen_dot = false;
            let mut seen_exp = false;
            while i < chars.len() {
                let c = chars[i].1;
                if c.is_ascii_digit() {
                    i += 1;
                } else if c == '.' && !seen_dot && !seen_exp {
                    seen_dot = true;
                    i += 1;
                } else if (c == 'e' || c == 'E') && !seen_exp {
                    let after = chars.get(i + 1).map(|(_, c)| *c);
                    let after2 = chars.get(i + 2).map(|(_, c)| *c);
                    let signed = matches!(after, Some('+') | Some('-'))
                        && after2.is_some_and(|c| c.is_ascii_digit());
                    if after.is_some_and(|c| c.is_ascii_digit()) {
                        seen_exp = true;
                        i += 1;
                    } else if signed {
                        seen_exp = true;
                        i += 2;
                    } else {
                        break;
                    }
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push(Token::new(TokenKind::Number, text));
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() {
                let c = chars[i].1;
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push(Token::word(text));
            continue;
        }

        let single = |kind: TokenKind| Token::new(kind, ch.to_string());
        match ch {
            '(' => tokens.push(single(TokenKind::LParen)),
            ')' => tokens.push(single(TokenKind::RParen)),
            ',' => tokens.push(single(TokenKind::Comma)),
            '.' => tokens.push(single(TokenKind::Dot)),
            ';' => tokens.push(single(TokenKind::Semicolon)),
            '<' | '>' | '=' | '!' | '|' | ':' => {
                let pair: Option<&str> = match (ch, next) {
                    ('<', Some('=')) => Some("<="),
                    ('<', Some('>')) => Some("<>"),
                    ('>', Some('=')) => Some(">="),
                    ('=', Some('=')) => Some("=="),
                    ('!', Some('=')) => Some("!="),
                    ('|', Some('|')) => Some("||"),
                    (':', Some(':')) => Some("::"),
                    _ => None,
                };
                if let Some(op) = pair {
                    tokens.push(Token::new(TokenKind::Op, op));
                    i += 2;
                    continue;
                }
                let kind = if matches!(ch, '<' | '>' | '=' | '|') {
                    TokenKind::Op
                } else {
                    TokenKind::Other
                };
                tokens.push(single(kind));
            }
            '+' | '-' | '*' | '/' | '%' | '&' | '~' => tokens.push(single(TokenKind::Op)),
            _ => tokens.push(single(TokenKind::Other)),
        }
        i += 1;
    }

    Lexed {
        tokens,
        error: None,
    }
}

/// Index of the `)` matching the `(` at `open`.
pub fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on top-level commas, respecting parenthesis depth.
pub fn split_top_level_commas(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                parts.push(&tokens[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn is_unary_sign(tokens: &[Token], idx: usize) -> bool {
    if !(tokens[idx].is_op("-") || tokens[idx].is_op("+")) {
        return false;
    }
    match idx.checked_sub(1).map(|p| &tokens[p]) {
        None => true,
        Some(prev) => match prev.kind {
            TokenKind::Op | TokenKind::LParen | TokenKind::Comma => true,
            TokenKind::Word => is_reserved(&prev.text) && !prev.is_any_keyword(&["END", "NULL", "TRUE", "FALSE"]),
            _ => false,
        },
    }
}

/// Render tokens with canonical spacing.
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (idx, token) in tokens.iter().enumerate() {
        if idx > 0 && needs_space(tokens, idx) {
            out.push(' ');
        }
        out.push_str(&token.text);
    }
    out
}

fn needs_space(tokens: &[Token], idx: usize) -> bool {
    let prev = &tokens[idx - 1];
    let cur = &tokens[idx];
    if matches!(
        cur.kind,
        TokenKind::RParen | TokenKind::Comma | TokenKind::Dot | TokenKind::Semicolon
    ) {
        return false;
    }
    if matches!(prev.kind, TokenKind::LParen | TokenKind::Dot) {
        return false;
    }
    if cur.kind == TokenKind::LParen {
        let is_call = match prev.kind {
            TokenKind::Word => !prev.is_any_keyword(SPACED_BEFORE_PAREN),
            TokenKind::QuotedIdent => true,
            _ => false,
        };
        return !is_call;
    }
    if is_unary_sign(tokens, idx - 1) {
        return false;
    }
    true
}

/// Tokenize then render; a convenience for normalising free text.
pub fn canonicalize(sql: &str) -> String {
    render(&tokenize(sql).tokens)
}
