//! Parser for the restricted SELECT / UNION ALL grammar.
//!
//! Parsing never fails with an error: anything outside the grammar comes back
//! as `ParsedStatement::Rejected` with `UnsupportedSyntax`.

use crate::ast::{
    ColumnRef, Expr, FromClause, Join, JoinConstraint, LimitClause, NullsOrder, OrderKey,
    OrderSpec, OutputColumn, ParsedStatement, SelectBranch, TableRef, UnionQuery, Wrapper,
    Direction,
};
use crate::error::Rejection;
use crate::lexer::{matching_paren, render, split_top_level_commas, tokenize, Token, TokenKind};

type ParseResult<T> = std::result::Result<T, Rejection>;

const JOIN_WORDS: &[&str] = &["NATURAL", "LEFT", "RIGHT", "FULL", "INNER", "CROSS", "OUTER", "JOIN"];

/// Parse raw SQL text.
pub fn parse(sql: &str) -> ParsedStatement {
    let lexed = tokenize(sql);
    if let Some(err) = lexed.error {
        return ParsedStatement::Rejected(Rejection::unsupported(format!(
            "Cannot tokenize statement: {}",
            err
        )));
    }
    parse_tokens(&lexed.tokens)
}

pub fn parse_tokens(tokens: &[Token]) -> ParsedStatement {
    match parse_query(tokens) {
        Ok(query) => ParsedStatement::Query(query),
        Err(rejection) => ParsedStatement::Rejected(rejection),
    }
}

#[derive(Debug, Default)]
struct Tail {
    order_by: Option<OrderSpec>,
    limit: Option<LimitClause>,
}

impl Tail {
    fn is_empty(&self) -> bool {
        self.order_by.is_none() && self.limit.is_none()
    }
}

struct Segment {
    branch: SelectBranch,
    tail: Tail,
    parenthesized: bool,
}

fn parse_query(tokens: &[Token]) -> ParseResult<UnionQuery> {
    let mut end = tokens.len();
    while end > 0 && tokens[end - 1].kind == TokenKind::Semicolon {
        end -= 1;
    }
    let tokens = &tokens[..end];

    if tokens.is_empty() {
        return Err(Rejection::unsupported("Empty statement"));
    }
    if tokens.iter().any(|t| t.kind == TokenKind::Semicolon) {
        return Err(Rejection::unsupported("Multiple statements are not supported").with_fragment(";"));
    }
    if tokens[0].is_keyword("WITH") {
        return Err(
            Rejection::unsupported("Common table expressions are not supported").with_fragment("WITH"),
        );
    }

    let segments = split_union(tokens)?;
    if segments.len() > 2 {
        return Err(Rejection::unsupported(format!(
            "At most two UNION ALL branches are supported, found {}",
            segments.len()
        )));
    }

    let mut parsed = segments
        .into_iter()
        .map(parse_segment)
        .collect::<ParseResult<Vec<_>>>()?;

    if parsed.len() == 1 {
        let Segment { mut branch, tail, .. } = parsed.remove(0);
        let Tail {
            mut order_by,
            mut limit,
        } = tail;
        if branch.wrapper.is_none() && (branch.order_by.is_some() || branch.limit.is_some()) {
            if order_by.is_some() || limit.is_some() {
                return Err(Rejection::unsupported(
                    "Nested ORDER BY/LIMIT on a single SELECT is not supported",
                ));
            }
            order_by = branch.order_by.take();
            limit = branch.limit.take();
        }
        return Ok(UnionQuery {
            branches: vec![branch],
            order_by,
            limit,
        });
    }

    let second = parsed.remove(1);
    let mut first = parsed.remove(0);

    if !first.tail.is_empty() {
        if first.parenthesized || first.branch.wrapper.is_some() {
            return Err(Rejection::unsupported(
                "ORDER BY/LIMIT between UNION ALL branches must sit inside the branch",
            ));
        }
        first.branch.order_by = first.tail.order_by.take();
        first.branch.limit = first.tail.limit.take();
    }

    let first_has_own_limit = first.branch.limit.is_some()
        && first.branch.wrapper.is_none()
        && !first.parenthesized;

    let Segment {
        branch: mut second_branch,
        tail,
        parenthesized,
    } = second;

    let mut order_by = None;
    let mut limit = None;
    let tail_is_branch_local = !parenthesized
        && second_branch.wrapper.is_none()
        && first_has_own_limit
        && tail.limit.is_some();
    if tail_is_branch_local {
        second_branch.order_by = tail.order_by;
        second_branch.limit = tail.limit;
    } else {
        order_by = tail.order_by;
        limit = tail.limit;
    }

    Ok(UnionQuery {
        branches: vec![first.branch, second_branch],
        order_by,
        limit,
    })
}

fn split_union(tokens: &[Token]) -> ParseResult<Vec<&[Token]>> {
    let mut segments = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut idx = 0;
    while idx < tokens.len() {
        let token = &tokens[idx];
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            _ if depth == 0 && token.is_any_keyword(&["INTERSECT", "EXCEPT"]) => {
                return Err(Rejection::unsupported(format!(
                    "{} is not supported; only UNION ALL may combine branches",
                    token.text.to_ascii_uppercase()
                ))
                .with_fragment(token.text.clone()));
            }
            _ if depth == 0 && token.is_keyword("UNION") => {
                if !tokens.get(idx + 1).is_some_and(|t| t.is_keyword("ALL")) {
                    return Err(Rejection::unsupported(
                        "UNION without ALL is not supported; use UNION ALL",
                    )
                    .with_fragment("UNION"));
                }
                segments.push(&tokens[start..idx]);
                idx += 2;
                start = idx;
                continue;
            }
            _ => {}
        }
        idx += 1;
    }
    if depth != 0 {
        return Err(Rejection::unsupported("Unbalanced parentheses"));
    }
    segments.push(&tokens[start..]);
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Rejection::unsupported("Empty UNION ALL branch"));
    }
    Ok(segments)
}

fn parse_segment(tokens: &[Token]) -> ParseResult<Segment> {
    if tokens[0].kind == TokenKind::LParen {
        let close = matching_paren(tokens, 0)
            .ok_or_else(|| Rejection::unsupported("Unbalanced parentheses"))?;
        let (mut branch, inner_tail) = parse_select(&tokens[1..close])?;
        if branch.wrapper.is_none() {
            branch.order_by = inner_tail.order_by;
            branch.limit = inner_tail.limit;
        } else if !inner_tail.is_empty() {
            return Err(Rejection::unsupported("Nested derived tables are not supported"));
        }
        let tail = parse_tail(&tokens[close + 1..])?;
        return Ok(Segment {
            branch,
            tail,
            parenthesized: true,
        });
    }
    let (branch, tail) = parse_select(tokens)?;
    Ok(Segment {
        branch,
        tail,
        parenthesized: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Clause {
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
}

impl Clause {
    fn keyword(&self) -> &'static str {
        match self {
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::Limit => "LIMIT",
        }
    }
}

/// Top-level clause keywords after FROM: (clause, keyword start, body start).
fn locate_clauses(tokens: &[Token]) -> ParseResult<Vec<(Clause, usize, usize)>> {
    let mut found: Vec<(Clause, usize, usize)> = Vec::new();
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Word if depth == 0 => {
                let followed_by_by = tokens.get(idx + 1).is_some_and(|t| t.is_keyword("BY"));
                let clause = if token.is_keyword("WHERE") {
                    Some((Clause::Where, idx + 1))
                } else if token.is_keyword("GROUP") && followed_by_by {
                    Some((Clause::GroupBy, idx + 2))
                } else if token.is_keyword("HAVING") {
                    Some((Clause::Having, idx + 1))
                } else if token.is_keyword("ORDER") && followed_by_by {
                    Some((Clause::OrderBy, idx + 2))
                } else if token.is_keyword("LIMIT") {
                    Some((Clause::Limit, idx + 1))
                } else if token.is_any_keyword(&["GROUP", "ORDER"]) {
                    return Err(Rejection::unsupported(format!(
                        "Expected BY after {}",
                        token.text.to_ascii_uppercase()
                    )));
                } else {
                    None
                };
                if let Some((clause, body)) = clause {
                    if let Some((last, _, _)) = found.last() {
                        if *last >= clause {
                            return Err(Rejection::unsupported(format!(
                                "Unexpected {} clause",
                                clause.keyword()
                            ))
                            .with_fragment(clause.keyword()));
                        }
                    }
                    found.push((clause, idx, body));
                }
            }
            _ => {}
        }
    }
    Ok(found)
}

fn clause_body<'a>(
    tokens: &'a [Token],
    clauses: &[(Clause, usize, usize)],
    wanted: Clause,
) -> ParseResult<Option<&'a [Token]>> {
    for (pos, (clause, _, body)) in clauses.iter().enumerate() {
        if *clause == wanted {
            let end = clauses.get(pos + 1).map(|c| c.1).unwrap_or(tokens.len());
            let span = &tokens[*body..end];
            if span.is_empty() {
                return Err(Rejection::unsupported(format!("Empty {} clause", wanted.keyword())));
            }
            return Ok(Some(span));
        }
    }
    Ok(None)
}

fn parse_tail_clauses(tokens: &[Token], clauses: &[(Clause, usize, usize)]) -> ParseResult<Tail> {
    let order_by = clause_body(tokens, clauses, Clause::OrderBy)?
        .map(parse_order_spec)
        .transpose()?;
    let limit = clause_body(tokens, clauses, Clause::Limit)?
        .map(parse_limit)
        .transpose()?;
    Ok(Tail { order_by, limit })
}

/// ORDER BY / LIMIT following a parenthesised branch.
fn parse_tail(tokens: &[Token]) -> ParseResult<Tail> {
    if tokens.is_empty() {
        return Ok(Tail::default());
    }
    let clauses = locate_clauses(tokens)?;
    let starts_clean = clauses.first().is_some_and(|c| c.1 == 0);
    let only_tail = clauses
        .iter()
        .all(|c| matches!(c.0, Clause::OrderBy | Clause::Limit));
    if !starts_clean || !only_tail {
        return Err(Rejection::unsupported(format!(
            "Unexpected `{}` after parenthesised SELECT",
            tokens[0].text
        ))
        .with_fragment(tokens[0].text.clone()));
    }
    parse_tail_clauses(tokens, &clauses)
}

fn find_top_level(tokens: &[Token], from: usize, keyword: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate().skip(from) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            _ if depth == 0 && token.is_keyword(keyword) => return Some(idx),
            _ => {}
        }
    }
    None
}

fn contains_subquery(tokens: &[Token]) -> bool {
    tokens
        .windows(2)
        .any(|w| w[0].kind == TokenKind::LParen && w[1].is_any_keyword(&["SELECT", "WITH", "VALUES"]))
}

fn parse_select(tokens: &[Token]) -> ParseResult<(SelectBranch, Tail)> {
    match tokens.first() {
        Some(t) if t.is_keyword("SELECT") => {}
        Some(t) => {
            return Err(Rejection::unsupported(format!(
                "Expected SELECT, found `{}`",
                t.text
            ))
            .with_fragment(t.text.clone()))
        }
        None => return Err(Rejection::unsupported("Empty SELECT")),
    }

    let mut idx = 1;
    let mut distinct = false;
    if tokens.get(idx).is_some_and(|t| t.is_keyword("DISTINCT")) {
        distinct = true;
        idx += 1;
    } else if tokens.get(idx).is_some_and(|t| t.is_keyword("ALL")) {
        idx += 1;
    }

    let from_idx = find_top_level(tokens, idx, "FROM")
        .ok_or_else(|| Rejection::unsupported("SELECT without FROM is not supported"))?;
    let projection = parse_projection(&tokens[idx..from_idx])?;
    let rest = &tokens[from_idx + 1..];
    let clauses = locate_clauses(rest)?;
    let from_end = clauses.first().map(|c| c.1).unwrap_or(rest.len());
    let from_span = &rest[..from_end];

    let is_derived = from_span.first().is_some_and(|t| t.kind == TokenKind::LParen)
        && from_span.get(1).is_some_and(|t| t.is_keyword("SELECT"));
    if is_derived {
        let bare_star = projection.len() == 1
            && projection[0].alias.is_none()
            && projection[0].expr.star_qualifier() == Some(None);
        let filtered = clauses
            .iter()
            .any(|c| matches!(c.0, Clause::Where | Clause::GroupBy | Clause::Having));
        if !bare_star || filtered || distinct {
            return Err(Rejection::unsupported("Subqueries are not supported").with_fragment("SELECT"));
        }
        let branch = parse_derived(from_span)?;
        let tail = parse_tail_clauses(rest, &clauses)?;
        if contains_subquery(&rest[from_end..]) {
            return Err(Rejection::unsupported("Subqueries are not supported").with_fragment("SELECT"));
        }
        return Ok((branch, tail));
    }

    if contains_subquery(tokens) {
        return Err(Rejection::unsupported("Subqueries are not supported").with_fragment("SELECT"));
    }

    let source = parse_from(from_span)?;
    let opaque = |clause| -> ParseResult<Option<Expr>> {
        Ok(clause_body(rest, &clauses, clause)?.map(|span| Expr::new(span.to_vec())))
    };
    let mut branch = SelectBranch::new(source, projection);
    branch.distinct = distinct;
    branch.where_clause = opaque(Clause::Where)?;
    branch.group_by = opaque(Clause::GroupBy)?;
    branch.having = opaque(Clause::Having)?;
    let tail = parse_tail_clauses(rest, &clauses)?;
    Ok((branch, tail))
}

/// `( SELECT ... ) [AS] alias` in FROM, the form produced by branch hoisting.
fn parse_derived(span: &[Token]) -> ParseResult<SelectBranch> {
    let close = matching_paren(span, 0).ok_or_else(|| Rejection::unsupported("Unbalanced parentheses"))?;
    let (mut inner, inner_tail) = parse_select(&span[1..close])?;
    if inner.wrapper.is_some() {
        return Err(Rejection::unsupported("Nested derived tables are not supported"));
    }
    inner.order_by = inner_tail.order_by;
    inner.limit = inner_tail.limit;

    let after = &span[close + 1..];
    let alias = match after {
        [] => None,
        [as_kw, name] if as_kw.is_keyword("AS") && name.is_identifier() => name.ident_name(),
        [name] if name.is_identifier() => name.ident_name(),
        _ => {
            let text = render(after);
            return Err(Rejection::unsupported(format!(
                "Unexpected `{}` after derived table",
                text
            ))
            .with_fragment(text));
        }
    };
    inner.wrapper = Some(Wrapper { alias });
    Ok(inner)
}

fn parse_projection(tokens: &[Token]) -> ParseResult<Vec<OutputColumn>> {
    if tokens.is_empty() {
        return Err(Rejection::unsupported("Empty select list"));
    }
    split_top_level_commas(tokens)
        .into_iter()
        .map(parse_output_column)
        .collect()
}

fn alias_name(token: &Token) -> Option<String> {
    match token.kind {
        TokenKind::Word | TokenKind::QuotedIdent if token.is_identifier() => token.ident_name(),
        TokenKind::StringLit => {
            let inner = &token.text[1..token.text.len().saturating_sub(1)];
            Some(inner.replace("''", "'"))
        }
        _ => None,
    }
}

fn ends_value(token: &Token) -> bool {
    match token.kind {
        TokenKind::RParen | TokenKind::Number | TokenKind::StringLit | TokenKind::QuotedIdent => true,
        TokenKind::Word => token.is_identifier() || token.is_any_keyword(&["END", "NULL"]),
        _ => false,
    }
}

fn parse_output_column(item: &[Token]) -> ParseResult<OutputColumn> {
    let n = item.len();
    if n == 0 {
        return Err(Rejection::unsupported("Empty column in select list"));
    }
    if n >= 3 && item[n - 2].is_keyword("AS") {
        let alias = alias_name(&item[n - 1]).ok_or_else(|| {
            Rejection::unsupported(format!("Invalid column alias `{}`", item[n - 1].text))
                .with_fragment(item[n - 1].text.clone())
        })?;
        return Ok(OutputColumn::new(Expr::new(item[..n - 2].to_vec()), Some(alias)));
    }
    if n >= 2 && item[n - 1].is_identifier() && ends_value(&item[n - 2]) {
        let alias = item[n - 1].ident_name();
        return Ok(OutputColumn::new(Expr::new(item[..n - 1].to_vec()), alias));
    }
    if item[n - 1].is_keyword("AS") || item[0].is_keyword("AS") {
        return Err(Rejection::unsupported("Dangling AS in select list").with_fragment(render(item)));
    }
    Ok(OutputColumn::new(Expr::new(item.to_vec()), None))
}

fn parse_table_ref(tokens: &[Token], idx: &mut usize) -> ParseResult<TableRef> {
    let first = tokens
        .get(*idx)
        .ok_or_else(|| Rejection::unsupported("Missing table name"))?;
    if first.kind == TokenKind::LParen {
        return Err(Rejection::unsupported("Subqueries are not supported").with_fragment("("));
    }
    let mut name = match first.ident_name() {
        Some(name) if first.is_identifier() => name,
        _ => {
            return Err(Rejection::unsupported(format!(
                "Expected a table name, found `{}`",
                first.text
            ))
            .with_fragment(first.text.clone()))
        }
    };
    *idx += 1;

    let mut schema = None;
    if tokens.get(*idx).is_some_and(|t| t.kind == TokenKind::Dot) {
        let table = tokens
            .get(*idx + 1)
            .filter(|t| t.is_identifier())
            .and_then(|t| t.ident_name())
            .ok_or_else(|| Rejection::unsupported("Expected a table name after `.`"))?;
        schema = Some(name);
        name = table;
        *idx += 2;
    }

    let mut alias = None;
    if tokens.get(*idx).is_some_and(|t| t.is_keyword("AS")) {
        let next = tokens
            .get(*idx + 1)
            .filter(|t| t.is_identifier())
            .and_then(|t| t.ident_name())
            .ok_or_else(|| Rejection::unsupported("Expected a table alias after AS"))?;
        alias = Some(next);
        *idx += 2;
    } else if let Some(next) = tokens.get(*idx).filter(|t| t.is_identifier()) {
        alias = next.ident_name();
        *idx += 1;
    }

    Ok(TableRef {
        schema,
        name,
        alias,
    })
}

fn starts_join(tokens: &[Token], idx: usize) -> bool {
    let token = &tokens[idx];
    token.kind == TokenKind::Comma
        || (token.is_any_keyword(JOIN_WORDS)
            && !tokens.get(idx + 1).is_some_and(|t| t.kind == TokenKind::LParen))
}

fn parse_from(tokens: &[Token]) -> ParseResult<FromClause> {
    let mut idx = 0;
    let base = parse_table_ref(tokens, &mut idx)?;
    let mut joins = Vec::new();

    while idx < tokens.len() {
        let token = &tokens[idx];
        let kind = if token.kind == TokenKind::Comma {
            idx += 1;
            ",".to_string()
        } else {
            let start = idx;
            loop {
                match tokens.get(idx) {
                    Some(t) if t.is_keyword("JOIN") => {
                        idx += 1;
                        break;
                    }
                    Some(t) if t.is_any_keyword(JOIN_WORDS) => idx += 1,
                    _ => {
                        return Err(Rejection::unsupported(format!(
                            "Unexpected `{}` in FROM clause",
                            token.text
                        ))
                        .with_fragment(token.text.clone()))
                    }
                }
            }
            tokens[start..idx]
                .iter()
                .map(|t| t.text.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(" ")
        };

        let table = parse_table_ref(tokens, &mut idx)?;
        let constraint = match tokens.get(idx) {
            Some(t) if t.is_keyword("ON") => {
                let body_start = idx + 1;
                let mut depth = 0i32;
                let mut end = body_start;
                while end < tokens.len() {
                    match tokens[end].kind {
                        TokenKind::LParen => depth += 1,
                        TokenKind::RParen => depth -= 1,
                        _ if depth == 0 && starts_join(tokens, end) => break,
                        _ => {}
                    }
                    end += 1;
                }
                if end == body_start {
                    return Err(Rejection::unsupported("Empty ON condition"));
                }
                idx = end;
                Some(JoinConstraint::On(Expr::new(tokens[body_start..end].to_vec())))
            }
            Some(t) if t.is_keyword("USING") => {
                let open = idx + 1;
                if !tokens.get(open).is_some_and(|t| t.kind == TokenKind::LParen) {
                    return Err(Rejection::unsupported("Expected `(` after USING"));
                }
                let close = matching_paren(tokens, open)
                    .ok_or_else(|| Rejection::unsupported("Unbalanced parentheses"))?;
                let columns = split_top_level_commas(&tokens[open + 1..close])
                    .into_iter()
                    .map(|part| match Expr::new(part.to_vec()).column_ref() {
                        Some(ColumnRef {
                            qualifier: None,
                            name,
                        }) => Ok(name),
                        _ => Err(Rejection::unsupported("USING expects a list of column names")),
                    })
                    .collect::<ParseResult<Vec<_>>>()?;
                idx = close + 1;
                Some(JoinConstraint::Using(columns))
            }
            _ => None,
        };

        if idx < tokens.len() && !starts_join(tokens, idx) {
            return Err(Rejection::unsupported(format!(
                "Unexpected `{}` in FROM clause",
                tokens[idx].text
            ))
            .with_fragment(tokens[idx].text.clone()));
        }

        joins.push(Join {
            kind,
            table,
            constraint,
        });
    }

    Ok(FromClause { base, joins })
}

fn parse_order_spec(tokens: &[Token]) -> ParseResult<OrderSpec> {
    let keys = split_top_level_commas(tokens)
        .into_iter()
        .map(|part| {
            let mut end = part.len();
            let mut nulls = None;
            if end >= 2 && part[end - 2].is_keyword("NULLS") {
                nulls = if part[end - 1].is_keyword("FIRST") {
                    Some(NullsOrder::First)
                } else if part[end - 1].is_keyword("LAST") {
                    Some(NullsOrder::Last)
                } else {
                    return Err(Rejection::unsupported("Expected FIRST or LAST after NULLS"));
                };
                end -= 2;
            }
            let mut direction = None;
            if end >= 1 && part[end - 1].is_keyword("ASC") {
                direction = Some(Direction::Asc);
                end -= 1;
            } else if end >= 1 && part[end - 1].is_keyword("DESC") {
                direction = Some(Direction::Desc);
                end -= 1;
            }
            if end == 0 {
                return Err(Rejection::unsupported("Empty ORDER BY key"));
            }
            Ok(OrderKey {
                expr: Expr::new(part[..end].to_vec()),
                direction,
                nulls,
            })
        })
        .collect::<ParseResult<Vec<_>>>()?;
    Ok(OrderSpec::new(keys))
}

fn limit_value(tokens: &[Token]) -> ParseResult<Expr> {
    match tokens {
        [n] if n.kind == TokenKind::Number => Ok(Expr::new(vec![n.clone()])),
        _ => {
            let text = render(tokens);
            Err(Rejection::unsupported(format!("LIMIT expects a number, found `{}`", text))
                .with_fragment(text))
        }
    }
}

fn parse_limit(tokens: &[Token]) -> ParseResult<LimitClause> {
    if let Some(pos) = tokens.iter().position(|t| t.is_keyword("OFFSET")) {
        return Ok(LimitClause {
            count: limit_value(&tokens[..pos])?,
            offset: Some(limit_value(&tokens[pos + 1..])?),
        });
    }
    if let Some(pos) = tokens.iter().position(|t| t.kind == TokenKind::Comma) {
        return Ok(LimitClause {
            count: limit_value(&tokens[pos + 1..])?,
            offset: Some(limit_value(&tokens[..pos])?),
        });
    }
    Ok(LimitClause {
        count: limit_value(tokens)?,
        offset: None,
    })
}
