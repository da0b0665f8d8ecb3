//! Cleanse-and-cast rewriting for numbers stored as text.
//!
//! A `NumericText` column reference is wrapped only where its value is
//! compared, sorted or computed. Display projections, `LIKE` and `IS NULL`
//! tests keep the raw text. References already inside `CAST(...)` are never
//! touched, so a second pass is a no-op.

use serde::{Deserialize, Serialize};

use crate::ast::{ColumnRef, Expr, JoinConstraint, OrderSpec, SelectBranch, UnionQuery};
use crate::catalog::{LogicalType, SchemaCatalog};
use crate::lexer::{render, tokenize, Token, TokenKind};

/// Shape of the canonical normalize-and-cast expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastStyle {
    /// Characters removed before casting (spaces, currency symbols).
    pub strip: Vec<String>,
    /// Replace a decimal comma with a dot.
    pub decimal_comma: bool,
    /// Target SQL type of the cast.
    pub cast_type: String,
}

impl Default for CastStyle {
    fn default() -> Self {
        Self {
            strip: vec![" ".to_string(), "₽".to_string()],
            decimal_comma: true,
            cast_type: "REAL".to_string(),
        }
    }
}

fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl CastStyle {
    /// Wrap a column expression, given as SQL text.
    pub fn wrap_sql(&self, column: &str) -> String {
        let mut inner = column.to_string();
        for ch in &self.strip {
            inner = format!("REPLACE({}, {}, '')", inner, sql_string(ch));
        }
        if self.decimal_comma {
            inner = format!("REPLACE({}, ',', '.')", inner);
        }
        format!("CAST({} AS {})", inner, self.cast_type)
    }

    pub fn wrap_tokens(&self, column: &[Token]) -> Vec<Token> {
        tokenize(&self.wrap_sql(&render(column))).tokens
    }
}

const AGGREGATES: &[&str] = &["SUM", "AVG", "MIN", "MAX", "TOTAL", "ROUND", "ABS"];
const COMPARISONS: &[&str] = &["<", ">", "<=", ">=", "=", "==", "!=", "<>"];
const ARITHMETIC: &[&str] = &["+", "-", "*", "/", "%"];

pub struct NumericCastNormalizer<'a> {
    catalog: &'a SchemaCatalog,
    style: &'a CastStyle,
}

impl<'a> NumericCastNormalizer<'a> {
    pub fn new(catalog: &'a SchemaCatalog, style: &'a CastStyle) -> Self {
        Self { catalog, style }
    }

    /// Rewrite every branch and the outer ORDER BY. Returns the number of
    /// column references wrapped.
    pub fn normalize(&self, query: &mut UnionQuery) -> usize {
        let mut rewritten = 0;
        for branch in query.branches.iter_mut() {
            rewritten += self.normalize_branch(branch);
        }

        if let Some(order) = query.order_by.as_mut() {
            let branches = &query.branches;
            let lookup = |col: &ColumnRef| {
                branches.iter().any(|b| self.column_type(b, col) == LogicalType::NumericText)
                    && !branches.iter().any(|b| shadowed_by_alias(b, col))
            };
            for key in order.keys.iter_mut() {
                let Some(column) = self.positional_column(branches, &key.expr) else {
                    continue;
                };
                if lookup(&column) {
                    key.expr = Expr::ident(&column.name);
                }
            }
            rewritten += self.normalize_order(order, &lookup);
        }
        rewritten
    }

    /// Column an outer `ORDER BY n` points at in branch 0, provided every
    /// branch projects a column of that name.
    fn positional_column(&self, branches: &[SelectBranch], expr: &Expr) -> Option<ColumnRef> {
        let position = expr.position()?;
        let column = branches.first()?.projection.get(position - 1)?;
        let reference = column.expr.column_ref()?;
        if column
            .alias
            .as_deref()
            .is_some_and(|a| !a.eq_ignore_ascii_case(&reference.name))
        {
            return None;
        }
        let everywhere = branches.iter().all(|b| {
            b.output_names()
                .iter()
                .flatten()
                .any(|n| n.eq_ignore_ascii_case(&reference.name))
        });
        everywhere.then(|| ColumnRef {
            qualifier: None,
            name: reference.name,
        })
    }

    fn normalize_branch(&self, branch: &mut SelectBranch) -> usize {
        let snapshot = branch.clone();
        let is_numeric = |col: &ColumnRef| self.column_type(&snapshot, col) == LogicalType::NumericText;
        let mut rewritten = 0;

        for column in branch.projection.iter_mut() {
            rewritten += self.rewrite_in_place(&mut column.expr, &is_numeric, false);
        }
        for join in branch.source.joins.iter_mut() {
            if let Some(JoinConstraint::On(expr)) = join.constraint.as_mut() {
                rewritten += self.rewrite_in_place(expr, &is_numeric, false);
            }
        }
        for clause in [
            branch.where_clause.as_mut(),
            branch.group_by.as_mut(),
            branch.having.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            rewritten += self.rewrite_in_place(clause, &is_numeric, false);
        }
        if let Some(order) = branch.order_by.as_mut() {
            let key_lookup =
                |col: &ColumnRef| is_numeric(col) && !shadowed_by_alias(&snapshot, col);
            rewritten += self.normalize_order(order, &key_lookup);
        }
        rewritten
    }

    fn normalize_order(&self, order: &mut OrderSpec, is_numeric: &dyn Fn(&ColumnRef) -> bool) -> usize {
        order
            .keys
            .iter_mut()
            .map(|key| self.rewrite_in_place(&mut key.expr, is_numeric, true))
            .sum()
    }

    fn column_type(&self, branch: &SelectBranch, col: &ColumnRef) -> LogicalType {
        match column_table(self.catalog, branch, col) {
            Some(table) => self.catalog.column_type(&table, &col.name),
            None => LogicalType::Unknown,
        }
    }

    fn rewrite_in_place(
        &self,
        expr: &mut Expr,
        is_numeric: &dyn Fn(&ColumnRef) -> bool,
        sort_key: bool,
    ) -> usize {
        let (tokens, count) = self.rewrite_tokens(expr.tokens(), is_numeric, sort_key);
        if count > 0 {
            *expr = Expr::new(tokens);
        }
        count
    }

    /// Wrap qualifying references in a token span.
    pub fn rewrite_tokens(
        &self,
        tokens: &[Token],
        is_numeric: &dyn Fn(&ColumnRef) -> bool,
        sort_key: bool,
    ) -> (Vec<Token>, usize) {
        let refs = reference_spans(tokens);
        let cast_depth = cast_membership(tokens);
        let mut out = Vec::with_capacity(tokens.len());
        let mut cursor = 0;
        let mut count = 0;

        for span in refs {
            if cast_depth[span.start] {
                continue;
            }
            if !is_numeric(&span.column) {
                continue;
            }
            let whole = sort_key && span.start == 0 && span.end == tokens.len();
            if !whole && !numeric_context(tokens, span.start, span.end, is_numeric) {
                continue;
            }
            out.extend_from_slice(&tokens[cursor..span.start]);
            out.extend(self.style.wrap_tokens(&tokens[span.start..span.end]));
            cursor = span.end;
            count += 1;
        }
        out.extend_from_slice(&tokens[cursor..]);
        (out, count)
    }
}

/// Table a column reference belongs to within a branch.
///
/// Unqualified references in a joined branch resolve to the single table
/// that declares the column, if there is exactly one.
pub fn column_table(catalog: &SchemaCatalog, branch: &SelectBranch, col: &ColumnRef) -> Option<String> {
    if let Some(table) = branch.resolve_column(col) {
        return Some(table.to_string());
    }
    if col.qualifier.is_some() {
        return None;
    }
    let mut owners = branch
        .tables()
        .filter(|t| catalog.has_column(&t.name, &col.name))
        .map(|t| t.name.clone());
    let first = owners.next()?;
    match owners.next() {
        Some(_) => None,
        None => Some(first),
    }
}

/// An unqualified sort key naming an output alias sorts by that output
/// column, which is not the catalog column unless the alias renames it.
fn shadowed_by_alias(branch: &SelectBranch, col: &ColumnRef) -> bool {
    col.qualifier.is_none()
        && branch.projection.iter().any(|c| {
            c.alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(&col.name))
                && !c
                    .expr
                    .column_ref()
                    .is_some_and(|r| r.name.eq_ignore_ascii_case(&col.name))
        })
}

struct RefSpan {
    start: usize,
    end: usize,
    column: ColumnRef,
}

fn reference_spans(tokens: &[Token]) -> Vec<RefSpan> {
    let mut spans = Vec::new();
    let mut idx = 0;
    while idx < tokens.len() {
        let token = &tokens[idx];
        let after_type_marker = idx.checked_sub(1).is_some_and(|p| {
            tokens[p].is_any_keyword(&["AS", "COLLATE"]) || tokens[p].is_op("::")
        });
        if !token.is_identifier() || after_type_marker {
            idx += 1;
            continue;
        }
        let next = tokens.get(idx + 1);
        if next.is_some_and(|t| t.kind == TokenKind::LParen) {
            idx += 1;
            continue;
        }
        if next.is_some_and(|t| t.kind == TokenKind::Dot) {
            let column = tokens.get(idx + 2).filter(|t| t.is_identifier());
            let is_call = tokens.get(idx + 3).is_some_and(|t| t.kind == TokenKind::LParen);
            match (column, is_call) {
                (Some(col), false) => {
                    if let (Some(qualifier), Some(name)) = (token.ident_name(), col.ident_name()) {
                        spans.push(RefSpan {
                            start: idx,
                            end: idx + 3,
                            column: ColumnRef {
                                qualifier: Some(qualifier),
                                name,
                            },
                        });
                    }
                    idx += 3;
                }
                _ => idx += 2,
            }
            continue;
        }
        if let Some(name) = token.ident_name() {
            spans.push(RefSpan {
                start: idx,
                end: idx + 1,
                column: ColumnRef {
                    qualifier: None,
                    name,
                },
            });
        }
        idx += 1;
    }
    spans
}

/// For each token, whether it sits inside a `CAST(...)` argument list.
fn cast_membership(tokens: &[Token]) -> Vec<bool> {
    let mut inside = Vec::with_capacity(tokens.len());
    let mut stack: Vec<bool> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => {
                let is_cast = idx
                    .checked_sub(1)
                    .is_some_and(|p| tokens[p].is_any_keyword(&["CAST", "TRY_CAST"]));
                inside.push(stack.iter().any(|c| *c));
                stack.push(is_cast);
            }
            TokenKind::RParen => {
                stack.pop();
                inside.push(stack.iter().any(|c| *c));
            }
            _ => inside.push(stack.iter().any(|c| *c)),
        }
    }
    inside
}

fn is_number_at(tokens: &[Token], idx: usize) -> bool {
    number_end(tokens, idx).is_some()
}

/// One past a numeric literal starting at `idx`. Signs and grouping
/// parentheses around the literal are allowed.
fn number_end(tokens: &[Token], idx: usize) -> Option<usize> {
    let token = tokens.get(idx)?;
    match token.kind {
        TokenKind::Number => Some(idx + 1),
        TokenKind::Op if token.is_op("-") || token.is_op("+") => number_end(tokens, idx + 1),
        TokenKind::LParen => {
            let inner = number_end(tokens, idx + 1)?;
            tokens
                .get(inner)
                .filter(|t| t.kind == TokenKind::RParen)
                .map(|_| inner + 1)
        }
        _ => None,
    }
}

fn numeric_context(
    tokens: &[Token],
    start: usize,
    end: usize,
    is_numeric: &dyn Fn(&ColumnRef) -> bool,
) -> bool {
    if tokens.get(end).is_some_and(|t| t.is_op("::")) {
        return false;
    }
    let prev = start.checked_sub(1).map(|p| &tokens[p]);
    let next = tokens.get(end);

    // Arithmetic on either side.
    if prev.is_some_and(|t| t.kind == TokenKind::Op && ARITHMETIC.contains(&t.text.as_str()))
        || next.is_some_and(|t| t.kind == TokenKind::Op && ARITHMETIC.contains(&t.text.as_str()))
    {
        return true;
    }

    // Comparison against a numeric operand.
    if next.is_some_and(|t| t.kind == TokenKind::Op && COMPARISONS.contains(&t.text.as_str()))
        && operand_is_numeric_forward(tokens, end + 1, is_numeric)
    {
        return true;
    }
    if prev.is_some_and(|t| t.kind == TokenKind::Op && COMPARISONS.contains(&t.text.as_str()))
        && operand_is_numeric_backward(tokens, start - 1, is_numeric)
    {
        return true;
    }

    // BETWEEN / IN with numeric bounds.
    let mut after = end;
    if tokens.get(after).is_some_and(|t| t.is_keyword("NOT")) {
        after += 1;
    }
    if tokens.get(after).is_some_and(|t| t.is_keyword("BETWEEN")) && is_number_at(tokens, after + 1) {
        return true;
    }
    if tokens.get(after).is_some_and(|t| t.is_keyword("IN"))
        && tokens.get(after + 1).is_some_and(|t| t.kind == TokenKind::LParen)
        && is_number_at(tokens, after + 2)
    {
        return true;
    }

    // First argument of a numeric aggregate.
    let mut open = start;
    if open > 0 && tokens[open - 1].is_keyword("DISTINCT") {
        open -= 1;
    }
    let opens_call = open >= 2
        && tokens[open - 1].kind == TokenKind::LParen
        && tokens[open - 2].is_any_keyword(AGGREGATES);
    let closes_arg = next.is_some_and(|t| matches!(t.kind, TokenKind::RParen | TokenKind::Comma));
    opens_call && closes_arg
}

fn operand_is_numeric_forward(tokens: &[Token], idx: usize, is_numeric: &dyn Fn(&ColumnRef) -> bool) -> bool {
    if is_number_at(tokens, idx) {
        return true;
    }
    match tokens.get(idx) {
        Some(t) if t.kind == TokenKind::LParen => operand_is_numeric_forward(tokens, idx + 1, is_numeric),
        Some(t) if t.is_any_keyword(&["CAST", "TRY_CAST"]) => true,
        Some(t) if t.is_any_keyword(AGGREGATES) => true,
        Some(t) if t.is_identifier() => {
            let span = &tokens[idx..];
            let column = match span {
                [q, dot, c, ..] if dot.kind == TokenKind::Dot && c.is_identifier() => {
                    q.ident_name().zip(c.ident_name()).map(|(q, c)| ColumnRef {
                        qualifier: Some(q),
                        name: c,
                    })
                }
                [c, ..] => c.ident_name().map(|name| ColumnRef { qualifier: None, name }),
                _ => None,
            };
            column.is_some_and(|c| is_numeric(&c))
        }
        _ => false,
    }
}

fn operand_is_numeric_backward(tokens: &[Token], op_idx: usize, is_numeric: &dyn Fn(&ColumnRef) -> bool) -> bool {
    let Some(idx) = op_idx.checked_sub(1) else {
        return false;
    };
    let token = &tokens[idx];
    match token.kind {
        TokenKind::Number => true,
        TokenKind::RParen => {
            // CAST(...), an aggregate call, or plain grouping parentheses.
            let mut depth = 0i32;
            let mut open = None;
            for back in (0..=idx).rev() {
                match tokens[back].kind {
                    TokenKind::RParen => depth += 1,
                    TokenKind::LParen => {
                        depth -= 1;
                        if depth == 0 {
                            open = Some(back);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let Some(open) = open else {
                return false;
            };
            match open.checked_sub(1).map(|f| &tokens[f]) {
                Some(f) if f.is_any_keyword(&["CAST", "TRY_CAST"]) || f.is_any_keyword(AGGREGATES) => true,
                Some(f) if f.is_identifier() => false,
                _ => operand_is_numeric_backward(tokens, idx, is_numeric),
            }
        }
        _ if token.is_identifier() => {
            let qualified = idx >= 2 && tokens[idx - 1].kind == TokenKind::Dot && tokens[idx - 2].is_identifier();
            let column = if qualified {
                tokens[idx - 2].ident_name().zip(token.ident_name()).map(|(q, c)| ColumnRef {
                    qualifier: Some(q),
                    name: c,
                })
            } else {
                token.ident_name().map(|name| ColumnRef { qualifier: None, name })
            };
            column.is_some_and(|c| is_numeric(&c))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ParsedStatement;
    use crate::parser::parse;

    const PRICE: &str = "CAST(REPLACE(REPLACE(REPLACE(price, ' ', ''), '₽', ''), ',', '.') AS REAL)";

    fn normalized(sql: &str) -> (String, usize) {
        let catalog = SchemaCatalog::inventory();
        let style = CastStyle::default();
        let mut query = match parse(sql) {
            ParsedStatement::Query(q) => q,
            ParsedStatement::Rejected(r) => panic!("{r}"),
        };
        let count = NumericCastNormalizer::new(&catalog, &style).normalize(&mut query);
        (query.to_sql(), count)
    }

    #[test]
    fn test_default_cast_style() {
        assert_eq!(CastStyle::default().wrap_sql("price"), PRICE);
        let plain = CastStyle {
            strip: vec!["'".to_string()],
            decimal_comma: false,
            cast_type: "NUMERIC".to_string(),
        };
        assert_eq!(plain.wrap_sql("p"), "CAST(REPLACE(p, '''', '') AS NUMERIC)");
    }

    #[test]
    fn test_comparison_is_wrapped() {
        let (sql, count) = normalized("SELECT mark FROM cars WHERE price < 50000");
        assert_eq!(count, 1);
        assert_eq!(sql, format!("SELECT mark FROM cars WHERE {} < 50000", PRICE));
    }

    #[test]
    fn test_reversed_comparison_and_between() {
        let (sql, count) = normalized("SELECT mark FROM cars WHERE 1000000 > price OR price BETWEEN 1 AND 5");
        assert_eq!(count, 2);
        assert!(sql.contains(&format!("1000000 > {}", PRICE)));
        assert!(sql.contains(&format!("{} BETWEEN 1 AND 5", PRICE)));
    }

    #[test]
    fn test_parenthesised_literal_is_numeric() {
        let (sql, count) = normalized("SELECT mark FROM cars WHERE price < (50000) OR (-10) > price");
        assert_eq!(count, 2);
        assert_eq!(
            sql,
            format!("SELECT mark FROM cars WHERE {p} < (50000) OR (-10) > {p}", p = PRICE)
        );
        let (_, count) = normalized("SELECT mark FROM cars WHERE price BETWEEN (1) AND 5 AND UPPER(city) = price");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_display_projection_and_text_tests_are_kept() {
        let (sql, count) = normalized(
            "SELECT mark, price FROM cars WHERE price IS NOT NULL AND price <> '' AND price LIKE '%1%'",
        );
        assert_eq!(count, 0);
        assert!(sql.starts_with("SELECT mark, price FROM cars"));
    }

    #[test]
    fn test_aggregates_and_sort_keys() {
        let (sql, count) = normalized("SELECT mark, AVG(price) AS avg_price FROM cars GROUP BY mark ORDER BY price DESC");
        assert_eq!(count, 2);
        assert!(sql.contains(&format!("AVG({}) AS avg_price", PRICE)));
        assert!(sql.ends_with(&format!("ORDER BY {} DESC", PRICE)));
    }

    #[test]
    fn test_qualified_reference_resolves_through_alias() {
        let (sql, count) = normalized("SELECT c.mark FROM cars c WHERE c.price <= 10");
        assert_eq!(count, 1);
        assert!(sql.contains("CAST(REPLACE(REPLACE(REPLACE(c.price, ' ', ''), '₽', ''), ',', '.') AS REAL) <= 10"));
    }

    #[test]
    fn test_unknown_and_integer_columns_are_untouched() {
        let (_, count) = normalized("SELECT mark FROM cars WHERE mileage < 100 AND unknown_col < 5");
        assert_eq!(count, 0);
        let (_, count) = normalized("SELECT mark FROM mystery WHERE price < 5");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let (once, _) = normalized("SELECT mark FROM cars WHERE price * 2 > 100 ORDER BY price");
        let (twice, count) = normalized(&once);
        assert_eq!(count, 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_computed_alias_shadows_sort_key() {
        let sql = format!("SELECT {} AS price FROM cars ORDER BY price", PRICE);
        let (out, count) = normalized(&sql);
        assert_eq!(count, 0);
        assert!(out.ends_with("ORDER BY price"));
    }

    #[test]
    fn test_alias_over_other_column_shadows_union_sort_key() {
        let (out, count) = normalized(
            "SELECT mark, sale_price AS price FROM cars UNION ALL SELECT mark, price FROM used_cars ORDER BY price",
        );
        assert_eq!(count, 0);
        assert!(out.ends_with("ORDER BY price"));

        let (_, count) = normalized("SELECT mark, price AS price FROM cars ORDER BY price");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_positional_union_key_on_numeric_column_is_cast() {
        let (out, count) = normalized(
            "SELECT mark, price FROM cars UNION ALL SELECT mark, price FROM used_cars ORDER BY 2 DESC",
        );
        assert_eq!(count, 1);
        assert!(out.ends_with(&format!("ORDER BY {} DESC", PRICE)));

        let (out, count) =
            normalized("SELECT mark, model FROM cars UNION ALL SELECT mark, model FROM used_cars ORDER BY 2");
        assert_eq!(count, 0);
        assert!(out.ends_with("ORDER BY 2"));
    }

    #[test]
    fn test_postgres_cast_is_respected() {
        let (_, count) = normalized("SELECT mark FROM cars WHERE price::numeric < 5");
        assert_eq!(count, 0);
    }
}
