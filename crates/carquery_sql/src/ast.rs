//! Typed statement tree for the accepted SELECT / UNION ALL grammar.
//!
//! Predicates and expressions stay opaque token spans. Only the statement
//! skeleton (branches, projections, sources, sort keys) is structured.

use crate::error::Rejection;
use crate::lexer::{is_reserved, render, tokenize, Token, TokenKind};

/// Result of parsing: a query, or the reason it could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStatement {
    Query(UnionQuery),
    Rejected(Rejection),
}

/// One or two SELECT branches joined with UNION ALL, plus outer clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionQuery {
    pub branches: Vec<SelectBranch>,
    pub order_by: Option<OrderSpec>,
    pub limit: Option<LimitClause>,
}

impl UnionQuery {
    pub fn is_union(&self) -> bool {
        self.branches.len() > 1
    }

    pub fn to_sql(&self) -> String {
        let in_union = self.is_union();
        let mut sql = self
            .branches
            .iter()
            .map(|branch| branch.to_sql_in(in_union))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        if let Some(order) = &self.order_by {
            if !order.keys.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.to_sql());
            }
        }
        if let Some(limit) = &self.limit {
            sql.push(' ');
            sql.push_str(&limit.to_sql());
        }
        sql
    }
}

/// Marks a branch rendered as `SELECT * FROM ( <branch> ) AS alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectBranch {
    pub distinct: bool,
    pub projection: Vec<OutputColumn>,
    pub source: FromClause,
    pub where_clause: Option<Expr>,
    pub group_by: Option<Expr>,
    pub having: Option<Expr>,
    pub order_by: Option<OrderSpec>,
    pub limit: Option<LimitClause>,
    pub wrapper: Option<Wrapper>,
}

impl SelectBranch {
    pub fn new(source: FromClause, projection: Vec<OutputColumn>) -> Self {
        Self {
            distinct: false,
            projection,
            source,
            where_clause: None,
            group_by: None,
            having: None,
            order_by: None,
            limit: None,
            wrapper: None,
        }
    }

    /// Name of the first table in FROM.
    pub fn source_table(&self) -> &str {
        &self.source.base.name
    }

    /// Every table reference in FROM, base first.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        std::iter::once(&self.source.base).chain(self.source.joins.iter().map(|j| &j.table))
    }

    /// Table name a qualifier refers to: an alias or a table name in FROM.
    pub fn resolve_qualifier(&self, qualifier: &str) -> Option<&str> {
        self.tables()
            .find(|t| t.binding().eq_ignore_ascii_case(qualifier))
            .or_else(|| self.tables().find(|t| t.name.eq_ignore_ascii_case(qualifier)))
            .map(|t| t.name.as_str())
    }

    /// Resolve a column reference to its table. Unqualified references
    /// resolve to the base table only when there are no joins.
    pub fn resolve_column(&self, column: &ColumnRef) -> Option<&str> {
        match &column.qualifier {
            Some(q) => self.resolve_qualifier(q),
            None if self.source.joins.is_empty() => Some(self.source_table()),
            None => None,
        }
    }

    pub fn output_names(&self) -> Vec<Option<String>> {
        self.projection.iter().map(|c| c.output_name()).collect()
    }

    pub fn has_star(&self) -> bool {
        self.projection.iter().any(|c| c.expr.star_qualifier().is_some())
    }

    fn core_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(
            &self
                .projection
                .iter()
                .map(|c| c.to_sql())
                .collect::<Vec<_>>()
                .join(", "),
        );
        sql.push_str(" FROM ");
        sql.push_str(&self.source.to_sql());
        if let Some(w) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&w.to_sql());
        }
        if let Some(g) = &self.group_by {
            sql.push_str(" GROUP BY ");
            sql.push_str(&g.to_sql());
        }
        if let Some(h) = &self.having {
            sql.push_str(" HAVING ");
            sql.push_str(&h.to_sql());
        }
        if let Some(order) = &self.order_by {
            if !order.keys.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.to_sql());
            }
        }
        if let Some(limit) = &self.limit {
            sql.push(' ');
            sql.push_str(&limit.to_sql());
        }
        sql
    }

    fn to_sql_in(&self, in_union: bool) -> String {
        let core = self.core_sql();
        match &self.wrapper {
            Some(Wrapper { alias: Some(alias) }) => {
                format!("SELECT * FROM ({}) AS {}", core, quote_ident(alias))
            }
            Some(Wrapper { alias: None }) => format!("SELECT * FROM ({})", core),
            None if in_union && (self.order_by.is_some() || self.limit.is_some()) => {
                format!("({})", core)
            }
            None => core,
        }
    }

    pub fn to_sql(&self) -> String {
        self.to_sql_in(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub base: TableRef,
    pub joins: Vec<Join>,
}

impl FromClause {
    pub fn table(base: TableRef) -> Self {
        Self {
            base,
            joins: Vec::new(),
        }
    }

    pub fn to_sql(&self) -> String {
        let mut sql = self.base.to_sql();
        for join in &self.joins {
            if join.kind == "," {
                sql.push_str(", ");
            } else {
                sql.push(' ');
                sql.push_str(&join.kind);
                sql.push(' ');
            }
            sql.push_str(&join.table.to_sql());
            match &join.constraint {
                Some(JoinConstraint::On(expr)) => {
                    sql.push_str(" ON ");
                    sql.push_str(&expr.to_sql());
                }
                Some(JoinConstraint::Using(cols)) => {
                    let cols: Vec<String> = cols.iter().map(|c| quote_ident(c)).collect();
                    sql.push_str(&format!(" USING ({})", cols.join(", ")));
                }
                None => {}
            }
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            alias: None,
        }
    }

    /// The name columns are qualified with inside the branch.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        if let Some(schema) = &self.schema {
            sql.push_str(&quote_ident(schema));
            sql.push('.');
        }
        sql.push_str(&quote_ident(&self.name));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&quote_ident(alias));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Canonical join keywords, e.g. `JOIN`, `LEFT JOIN`, or `,`.
    pub kind: String,
    pub table: TableRef,
    pub constraint: Option<JoinConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinConstraint {
    On(Expr),
    Using(Vec<String>),
}

/// A projected column: expression plus optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl OutputColumn {
    pub fn new(expr: Expr, alias: Option<String>) -> Self {
        Self { expr, alias }
    }

    /// `NULL AS name`, used to pad a branch.
    pub fn null_as(name: &str) -> Self {
        Self::new(Expr::null(), Some(name.to_string()))
    }

    /// Externally visible name: the alias, else a bare column's name.
    pub fn output_name(&self) -> Option<String> {
        self.alias
            .clone()
            .or_else(|| self.expr.column_ref().map(|c| c.name))
    }

    pub fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.expr.to_sql(), quote_ident(alias)),
            None => self.expr.to_sql(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub direction: Option<Direction>,
    pub nulls: Option<NullsOrder>,
}

impl OrderKey {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            direction: None,
            nulls: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::Asc)
    }

    pub fn to_sql(&self) -> String {
        let mut sql = self.expr.to_sql();
        match self.direction {
            Some(Direction::Asc) => sql.push_str(" ASC"),
            Some(Direction::Desc) => sql.push_str(" DESC"),
            None => {}
        }
        match self.nulls {
            Some(NullsOrder::First) => sql.push_str(" NULLS FIRST"),
            Some(NullsOrder::Last) => sql.push_str(" NULLS LAST"),
            None => {}
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderSpec {
    pub keys: Vec<OrderKey>,
}

impl OrderSpec {
    pub fn new(keys: Vec<OrderKey>) -> Self {
        Self { keys }
    }

    pub fn to_sql(&self) -> String {
        self.keys
            .iter()
            .map(|k| k.to_sql())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitClause {
    pub count: Expr,
    pub offset: Option<Expr>,
}

impl LimitClause {
    pub fn to_sql(&self) -> String {
        match &self.offset {
            Some(offset) => format!("LIMIT {} OFFSET {}", self.count.to_sql(), offset.to_sql()),
            None => format!("LIMIT {}", self.count.to_sql()),
        }
    }
}

/// A plain or table-qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

/// An opaque expression kept as a token span.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expr(pub Vec<Token>);

impl Expr {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self(tokens)
    }

    pub fn parse(text: &str) -> Self {
        Self(tokenize(text).tokens)
    }

    pub fn null() -> Self {
        Self(vec![Token::word("NULL")])
    }

    pub fn ident(name: &str) -> Self {
        Self(vec![ident_token(name)])
    }

    pub fn qualified(qualifier: &str, name: &str) -> Self {
        Self(vec![
            ident_token(qualifier),
            Token::new(TokenKind::Dot, "."),
            ident_token(name),
        ])
    }

    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_sql(&self) -> String {
        render(&self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0.len() == 1 && self.0[0].is_keyword("NULL")
    }

    pub fn column_ref(&self) -> Option<ColumnRef> {
        match self.0.as_slice() {
            [name] if name.is_identifier() => Some(ColumnRef {
                qualifier: None,
                name: name.ident_name()?,
            }),
            [qualifier, dot, name]
                if qualifier.is_identifier()
                    && dot.kind == TokenKind::Dot
                    && name.is_identifier() =>
            {
                Some(ColumnRef {
                    qualifier: Some(qualifier.ident_name()?),
                    name: name.ident_name()?,
                })
            }
            _ => None,
        }
    }

    /// `Some(None)` for `*`, `Some(Some(t))` for `t.*`.
    pub fn star_qualifier(&self) -> Option<Option<String>> {
        match self.0.as_slice() {
            [star] if star.is_op("*") => Some(None),
            [qualifier, dot, star]
                if qualifier.is_identifier() && dot.kind == TokenKind::Dot && star.is_op("*") =>
            {
                Some(Some(qualifier.ident_name()?))
            }
            _ => None,
        }
    }

    /// A 1-based output position, e.g. `ORDER BY 2`.
    pub fn position(&self) -> Option<usize> {
        match self.0.as_slice() {
            [n] if n.kind == TokenKind::Number => n.text.parse().ok().filter(|p| *p > 0),
            _ => None,
        }
    }

    /// Split a trailing `COLLATE name` off the expression.
    pub fn split_collation(&self) -> (Expr, Vec<Token>) {
        let n = self.0.len();
        if n >= 3 && self.0[n - 2].is_keyword("COLLATE") {
            return (Expr(self.0[..n - 2].to_vec()), self.0[n - 2..].to_vec());
        }
        (self.clone(), Vec::new())
    }

    /// Copy with every `qualifier.` prefix removed.
    pub fn strip_qualifiers(&self) -> Expr {
        let tokens = &self.0;
        let mut out = Vec::with_capacity(tokens.len());
        let mut idx = 0;
        while idx < tokens.len() {
            let is_prefix = tokens[idx].is_identifier()
                && tokens.get(idx + 1).is_some_and(|t| t.kind == TokenKind::Dot)
                && tokens
                    .get(idx + 2)
                    .is_some_and(|t| t.is_identifier() || t.is_op("*"));
            if is_prefix {
                idx += 2;
                continue;
            }
            out.push(tokens[idx].clone());
            idx += 1;
        }
        Expr(out)
    }

    /// Structural equality ignoring qualifiers and identifier case.
    pub fn same_as(&self, other: &Expr) -> bool {
        let a = self.strip_qualifiers();
        let b = other.strip_qualifiers();
        a.0.len() == b.0.len()
            && a.0.iter().zip(b.0.iter()).all(|(x, y)| {
                x.kind == y.kind
                    && match x.kind {
                        TokenKind::Word | TokenKind::QuotedIdent => match (x.ident_name(), y.ident_name()) {
                            (Some(p), Some(q)) => p.eq_ignore_ascii_case(&q),
                            _ => false,
                        },
                        _ => x.text == y.text,
                    }
            })
    }

    /// Column references appearing anywhere in the expression.
    pub fn column_refs(&self) -> Vec<ColumnRef> {
        let tokens = &self.0;
        let mut refs = Vec::new();
        let mut idx = 0;
        while idx < tokens.len() {
            let tok = &tokens[idx];
            let type_name = idx.checked_sub(1).is_some_and(|p| {
                tokens[p].is_any_keyword(&["AS", "COLLATE"]) || tokens[p].is_op("::")
            });
            if !tok.is_identifier() || type_name {
                idx += 1;
                continue;
            }
            let next = tokens.get(idx + 1);
            if next.is_some_and(|t| t.kind == TokenKind::LParen) {
                idx += 1;
                continue;
            }
            if next.is_some_and(|t| t.kind == TokenKind::Dot) {
                if let Some(col) = tokens.get(idx + 2).filter(|t| t.is_identifier()) {
                    if let (Some(qualifier), Some(name)) = (tok.ident_name(), col.ident_name()) {
                        refs.push(ColumnRef {
                            qualifier: Some(qualifier),
                            name,
                        });
                    }
                    idx += 3;
                    continue;
                }
                idx += 2;
                continue;
            }
            if let Some(name) = tok.ident_name() {
                refs.push(ColumnRef {
                    qualifier: None,
                    name,
                });
            }
            idx += 1;
        }
        refs
    }
}

fn ident_token(name: &str) -> Token {
    let quoted = quote_ident(name);
    if quoted.starts_with('"') {
        Token::new(TokenKind::QuotedIdent, quoted)
    } else {
        Token::word(quoted)
    }
}

/// Render an identifier, quoting it only when it would not lex back as a word.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !is_reserved(name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
