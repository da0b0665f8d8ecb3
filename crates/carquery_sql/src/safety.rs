//! Read-only guard for candidate SQL.
//!
//! The only stage that produces fatal rejections. Lexical checks run on the
//! token stream so keywords inside string literals and comments never match.

use tracing::debug;

use crate::ast::{ParsedStatement, UnionQuery};
use crate::catalog::SchemaCatalog;
use crate::error::Rejection;
use crate::lexer::{tokenize, Token, TokenKind};
use crate::parser::parse_tokens;

/// Statement keywords that write or administer the database.
pub const FORBIDDEN_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "EXEC", "EXECUTE", "GRANT",
    "REVOKE", "TRUNCATE", "MERGE", "CALL", "LOCK", "UNLOCK", "ATTACH", "DETACH", "PRAGMA",
    "VACUUM", "REINDEX", "COPY", "INSTALL",
];

/// Function names that reach the file system or load native code.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    "LOAD_FILE",
    "LOAD_EXTENSION",
    "READFILE",
    "WRITEFILE",
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_LS_DIR",
    "LO_IMPORT",
    "LO_EXPORT",
];

/// Words that only appear in file export clauses.
const DANGEROUS_WORDS: &[&str] = &["INTO", "OUTFILE", "DUMPFILE"];

/// System catalogs that expose schema or credentials.
const SYSTEM_CATALOGS: &[&str] = &[
    "SQLITE_MASTER",
    "SQLITE_SCHEMA",
    "SQLITE_TEMP_MASTER",
    "SQLITE_TEMP_SCHEMA",
    "PG_CATALOG",
    "PG_SHADOW",
    "PG_AUTHID",
    "PG_USER",
    "INFORMATION_SCHEMA",
];

pub struct SafetyValidator<'a> {
    catalog: &'a SchemaCatalog,
}

impl<'a> SafetyValidator<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    /// Validate raw SQL and return the parsed query.
    ///
    /// Lexical checks run before the parser so that unparseable input with a
    /// write keyword still reports `ForbiddenVerb`, and an unparseable join of
    /// incompatible tables still reports `IllegalJoin`.
    pub fn validate_sql(&self, sql: &str) -> Result<UnionQuery, Rejection> {
        let lexed = tokenize(sql);
        check_forbidden_verbs(&lexed.tokens)?;
        check_dangerous_constructs(&lexed.tokens)?;

        if let Some(err) = lexed.error {
            self.check_joins_lexical(&lexed.tokens)?;
            return Err(Rejection::unsupported(format!("Cannot tokenize statement: {}", err)));
        }

        match parse_tokens(&lexed.tokens) {
            ParsedStatement::Query(query) => {
                self.check_joins(&query)?;
                Ok(query)
            }
            ParsedStatement::Rejected(rejection) => {
                self.check_joins_lexical(&lexed.tokens)?;
                Err(rejection)
            }
        }
    }

    /// Validate an already parsed statement.
    pub fn validate(&self, statement: &ParsedStatement) -> Result<(), Rejection> {
        let query = match statement {
            ParsedStatement::Rejected(rejection) => return Err(rejection.clone()),
            ParsedStatement::Query(query) => query,
        };
        let tokens = tokenize(&query.to_sql()).tokens;
        check_forbidden_verbs(&tokens)?;
        check_dangerous_constructs(&tokens)?;
        self.check_joins(query)
    }

    /// Every pair of tables combined inside one branch must be compatible.
    pub fn check_joins(&self, query: &UnionQuery) -> Result<(), Rejection> {
        for branch in &query.branches {
            let tables: Vec<&str> = branch.tables().map(|t| t.name.as_str()).collect();
            self.check_table_set(&tables)?;
        }
        Ok(())
    }

    fn check_table_set(&self, tables: &[&str]) -> Result<(), Rejection> {
        for (i, left) in tables.iter().enumerate() {
            for right in &tables[i + 1..] {
                if self.catalog.is_incompatible_join(left, right) {
                    debug!(left = %left, right = %right, "incompatible tables joined");
                    return Err(Rejection::illegal_join(left, right));
                }
            }
        }
        Ok(())
    }

    /// Token-level join scan for statements the parser cannot structure.
    ///
    /// Tables are grouped per SELECT scope. A derived table in FROM/JOIN
    /// contributes its tables to the enclosing scope.
    pub fn check_joins_lexical(&self, tokens: &[Token]) -> Result<(), Rejection> {
        let mut scopes: Vec<Scope> = Vec::new();
        let mut pending_derived: Option<(usize, i32)> = None;
        // Depths of parenthesised table groups such as `JOIN (used_cars)`.
        let mut groups: Vec<i32> = Vec::new();
        let mut depth = 0i32;
        let mut idx = 0;

        while idx < tokens.len() {
            let token = &tokens[idx];
            match token.kind {
                TokenKind::LParen => {
                    let subquery = tokens.get(idx + 1).is_some_and(|t| t.is_keyword("SELECT"));
                    if let Some(scope) = scopes.last_mut().filter(|s| s.depth == depth) {
                        if scope.expecting_table && !subquery {
                            groups.push(depth);
                            idx += 1;
                            continue;
                        }
                        if scope.expecting_table {
                            scope.expecting_table = false;
                            pending_derived = Some((scopes.len() - 1, depth + 1));
                        }
                    }
                    depth += 1;
                }
                TokenKind::RParen if groups.last() == Some(&depth) => {
                    groups.pop();
                }
                TokenKind::RParen => {
                    depth -= 1;
                    while scopes.last().is_some_and(|s| s.depth > depth) {
                        scopes.pop();
                    }
                }
                TokenKind::Comma => {
                    if let Some(scope) = scopes.last_mut().filter(|s| s.depth == depth) {
                        if scope.in_from {
                            scope.expecting_table = true;
                        }
                    }
                }
                TokenKind::Word if token.is_keyword("SELECT") => {
                    while scopes.last().is_some_and(|s| s.depth >= depth) {
                        scopes.pop();
                    }
                    let parent = match pending_derived.take() {
                        Some((parent, d)) if d == depth => Some(parent),
                        _ => None,
                    };
                    scopes.push(Scope::new(depth, parent));
                }
                TokenKind::Word if token.is_keyword("FROM") || token.is_keyword("JOIN") => {
                    if let Some(scope) = scopes.last_mut().filter(|s| s.depth == depth) {
                        scope.in_from = true;
                        scope.expecting_table = true;
                    }
                }
                TokenKind::Word
                    if token.is_any_keyword(&[
                        "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "UNION", "ON", "USING",
                    ]) =>
                {
                    if let Some(scope) = scopes.last_mut().filter(|s| s.depth == depth) {
                        scope.in_from = false;
                        scope.expecting_table = false;
                    }
                }
                TokenKind::Word | TokenKind::QuotedIdent => {
                    let top = scopes.len().checked_sub(1);
                    if let Some(top) = top.filter(|t| scopes[*t].depth == depth && scopes[*t].expecting_table) {
                        let mut name = token.ident_name();
                        let qualified = tokens.get(idx + 1).is_some_and(|t| t.kind == TokenKind::Dot);
                        if qualified {
                            name = tokens.get(idx + 2).and_then(|t| t.ident_name());
                            idx += 2;
                        }
                        scopes[top].expecting_table = false;
                        if let Some(name) = name {
                            let mut target = Some(top);
                            while let Some(t) = target {
                                self.record_table(&mut scopes[t], &name)?;
                                target = scopes[t].parent;
                            }
                        }
                    }
                }
                _ => {}
            }
            idx += 1;
        }
        Ok(())
    }

    fn record_table(&self, scope: &mut Scope, name: &str) -> Result<(), Rejection> {
        for existing in &scope.tables {
            if self.catalog.is_incompatible_join(existing, name) {
                return Err(Rejection::illegal_join(existing, name));
            }
        }
        scope.tables.push(name.to_string());
        Ok(())
    }
}

struct Scope {
    depth: i32,
    parent: Option<usize>,
    tables: Vec<String>,
    in_from: bool,
    expecting_table: bool,
}

impl Scope {
    fn new(depth: i32, parent: Option<usize>) -> Self {
        Self {
            depth,
            parent,
            tables: Vec::new(),
            in_from: false,
            expecting_table: false,
        }
    }
}

/// Reject any write/admin keyword outside string literals.
pub fn check_forbidden_verbs(tokens: &[Token]) -> Result<(), Rejection> {
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Word {
            continue;
        }
        if token.is_any_keyword(FORBIDDEN_VERBS) {
            return Err(Rejection::forbidden_verb(&token.text));
        }
        if token.is_keyword("REPLACE") && tokens.get(idx + 1).is_some_and(|t| t.is_keyword("INTO")) {
            return Err(Rejection::forbidden_verb("REPLACE INTO"));
        }
    }
    Ok(())
}

/// Reject file access, extension loading and system catalog access.
pub fn check_dangerous_constructs(tokens: &[Token]) -> Result<(), Rejection> {
    for (idx, token) in tokens.iter().enumerate() {
        let name = match token.kind {
            TokenKind::Word | TokenKind::QuotedIdent => match token.ident_name() {
                Some(name) => name.to_ascii_uppercase(),
                None => continue,
            },
            _ => continue,
        };
        let name = name.as_str();
        if token.kind == TokenKind::Word && DANGEROUS_WORDS.contains(&name) {
            return Err(Rejection::dangerous(&token.text));
        }
        if DANGEROUS_FUNCTIONS.contains(&name) {
            return Err(Rejection::dangerous(&token.text));
        }
        if name == "LOAD" && tokens.get(idx + 1).is_some_and(|t| t.is_any_keyword(&["DATA", "EXTENSION"])) {
            return Err(Rejection::dangerous(&format!("LOAD {}", tokens[idx + 1].text)));
        }
        if SYSTEM_CATALOGS.contains(&name) {
            return Err(Rejection::dangerous(&token.text));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReasonCode;

    fn reason(sql: &str) -> Option<ReasonCode> {
        let catalog = SchemaCatalog::inventory();
        SafetyValidator::new(&catalog)
            .validate_sql(sql)
            .err()
            .map(|r| r.reason)
    }

    #[test]
    fn test_plain_select_passes() {
        assert_eq!(reason("SELECT mark, model FROM cars WHERE city = 'Москва'"), None);
    }

    #[test]
    fn test_forbidden_verbs_are_rejected() {
        for sql in [
            "DROP TABLE cars",
            "SELECT mark FROM cars; DELETE FROM cars",
            "update cars set price = 1",
            "SELECT mark FROM cars WHERE 1 = 1 UNION ALL INSERT INTO x VALUES (1)",
            "REPLACE INTO cars (id) VALUES (1)",
            "PRAGMA table_info(cars)",
            "ATTACH DATABASE 'x.db' AS x",
        ] {
            assert_eq!(reason(sql), Some(ReasonCode::ForbiddenVerb), "{sql}");
        }
    }

    #[test]
    fn test_keywords_inside_literals_and_comments_are_ignored() {
        assert_eq!(reason("SELECT mark FROM cars WHERE status = 'DELETE ME'"), None);
        assert_eq!(reason("SELECT mark FROM cars -- DROP TABLE cars"), None);
        assert_eq!(reason("SELECT mark /* UPDATE */ FROM cars"), None);
        assert_eq!(reason("SELECT mark, deleted_at FROM cars"), None);
    }

    #[test]
    fn test_replace_function_is_allowed() {
        assert_eq!(reason("SELECT REPLACE(price, ' ', '') AS p FROM cars"), None);
    }

    #[test]
    fn test_dangerous_constructs() {
        for sql in [
            "SELECT mark FROM cars INTO OUTFILE '/tmp/x'",
            "SELECT LOAD_FILE('/etc/passwd') AS f FROM cars",
            "SELECT load_extension('evil') AS x FROM cars",
            "SELECT name FROM sqlite_master",
            "SELECT table_name FROM information_schema.tables",
            "SELECT readfile('/etc/passwd') AS x FROM cars",
        ] {
            assert_eq!(reason(sql), Some(ReasonCode::DangerousConstruct), "{sql}");
        }
    }

    #[test]
    fn test_incompatible_join_is_rejected() {
        assert_eq!(
            reason("SELECT c.mark FROM cars c JOIN used_cars u ON c.id = u.car_id"),
            Some(ReasonCode::IllegalJoin)
        );
        assert_eq!(
            reason("SELECT c.mark FROM cars c, used_cars u WHERE c.mark = u.mark"),
            Some(ReasonCode::IllegalJoin)
        );
    }

    #[test]
    fn test_compatible_join_and_union_pass() {
        assert_eq!(
            reason("SELECT c.mark, o.name FROM cars c JOIN car_options o ON c.id = o.car_id"),
            None
        );
        assert_eq!(
            reason("SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars"),
            None
        );
    }

    #[test]
    fn test_illegal_join_wins_over_unsupported_syntax() {
        assert_eq!(
            reason(
                "WITH x AS (SELECT 1) SELECT c.mark FROM cars c JOIN used_cars u ON c.id = u.car_id"
            ),
            Some(ReasonCode::IllegalJoin)
        );
        assert_eq!(
            reason("SELECT c.mark FROM cars c JOIN (SELECT * FROM used_cars) u ON c.id = u.id"),
            Some(ReasonCode::IllegalJoin)
        );
        assert_eq!(
            reason("SELECT c.mark FROM cars c JOIN (used_cars) u ON c.id = u.id"),
            Some(ReasonCode::IllegalJoin)
        );
        assert_eq!(
            reason("SELECT c.mark FROM (cars c JOIN (used_cars u)) WHERE c.id = u.id"),
            Some(ReasonCode::IllegalJoin)
        );
        assert_eq!(
            reason("SELECT mark FROM cars WHERE id IN (SELECT id FROM used_cars)"),
            Some(ReasonCode::UnsupportedSyntax)
        );
    }

    #[test]
    fn test_validate_parsed_statement() {
        let catalog = SchemaCatalog::inventory();
        let validator = SafetyValidator::new(&catalog);
        let rejected = ParsedStatement::Rejected(Rejection::unsupported("nope"));
        assert_eq!(
            validator.validate(&rejected).map_err(|r| r.reason),
            Err(ReasonCode::UnsupportedSyntax)
        );
        let query = validator.validate_sql("SELECT mark FROM cars").expect("valid");
        assert!(validator.validate(&ParsedStatement::Query(query)).is_ok());
    }
}
