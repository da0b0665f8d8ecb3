//! ORDER BY repair for two-branch UNION ALL queries.
//!
//! After this pass every outer sort key is a bare output alias shared by both
//! branches, or a position both branches agree on. Per-branch ORDER BY/LIMIT
//! survives only inside a derived table.

use tracing::{debug, warn};

use crate::ast::{ColumnRef, Expr, OrderKey, OrderSpec, OutputColumn, SelectBranch, UnionQuery, Wrapper};
use crate::catalog::SchemaCatalog;
use crate::lexer::{Token, TokenKind};
use crate::numeric::column_table;
use crate::pipeline::Repair;

const ORDER_KEY_PREFIX: &str = "order_key_";

pub struct OrderByResolver<'a> {
    catalog: &'a SchemaCatalog,
}

enum Resolution {
    Keep,
    Rename { alias: String, repair: Option<Repair> },
    Drop,
}

impl<'a> OrderByResolver<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    pub fn resolve(&self, query: &mut UnionQuery) -> Vec<Repair> {
        let mut repairs = Vec::new();
        if query.branches.len() != 2 {
            return repairs;
        }

        self.isolate_branch_clauses(query, &mut repairs);

        let Some(order) = query.order_by.take() else {
            return repairs;
        };

        let mut keys = Vec::with_capacity(order.keys.len());
        for key in order.keys {
            let (base, collation) = key.expr.split_collation();
            let base_key = OrderKey {
                expr: base,
                ..key.clone()
            };
            match self.resolve_key(&base_key, &mut query.branches) {
                Resolution::Keep => keys.push(key),
                Resolution::Rename { alias, repair } => {
                    if let Some(repair) = repair {
                        debug!(repair = %repair, "order by repair");
                        repairs.push(repair);
                    }
                    let mut tokens = Expr::ident(&alias).tokens().to_vec();
                    tokens.extend(collation);
                    keys.push(OrderKey {
                        expr: Expr::new(tokens),
                        ..key
                    });
                }
                Resolution::Drop => {
                    let text = key.expr.to_sql();
                    warn!(key = %text, "dropping ORDER BY key that cannot be resolved across branches");
                    repairs.push(Repair::KeyDropped { key: text });
                }
            }
        }

        if !keys.is_empty() {
            query.order_by = Some(OrderSpec::new(keys));
        }
        repairs
    }

    /// Wrap branches carrying LIMIT; lift or drop a bare per-branch ORDER BY.
    fn isolate_branch_clauses(&self, query: &mut UnionQuery, repairs: &mut Vec<Repair>) {
        for idx in 0..query.branches.len() {
            let branch = &mut query.branches[idx];
            if branch.wrapper.is_some() {
                continue;
            }
            if branch.limit.is_some() {
                let alias = format!("branch_{}", idx + 1);
                branch.wrapper = Some(Wrapper {
                    alias: Some(alias.clone()),
                });
                debug!(branch = idx, alias = %alias, "wrapping branch with its own LIMIT");
                repairs.push(Repair::BranchWrapped { branch: idx, alias });
                continue;
            }
            let Some(order) = branch.order_by.take() else {
                continue;
            };
            if query.order_by.is_none() {
                query.order_by = Some(order);
                repairs.push(Repair::OrderLifted { branch: idx });
            } else {
                for key in order.keys {
                    let text = key.expr.to_sql();
                    warn!(branch = idx, key = %text, "dropping per-branch ORDER BY without LIMIT");
                    repairs.push(Repair::KeyDropped { key: text });
                }
            }
        }
    }

    fn resolve_key(&self, key: &OrderKey, branches: &mut [SelectBranch]) -> Resolution {
        let shared = shared_aliases(branches);
        let width = branches[0].projection.len();

        if let Some(position) = key.expr.position() {
            return match shared.get(position - 1) {
                Some(Some(alias)) => Resolution::Rename {
                    alias: alias.clone(),
                    repair: Some(Repair::PositionAliased {
                        position,
                        alias: alias.clone(),
                    }),
                },
                _ if position <= width && branches.iter().all(|b| b.projection.len() == width) => {
                    Resolution::Keep
                }
                _ => Resolution::Drop,
            };
        }

        if let Some(column) = key.expr.column_ref() {
            let matching = shared
                .iter()
                .flatten()
                .find(|alias| alias.eq_ignore_ascii_case(&column.name));
            if let Some(alias) = matching {
                if column.qualifier.is_none() && alias == &column.name {
                    return Resolution::Keep;
                }
                return Resolution::Rename {
                    alias: alias.clone(),
                    repair: Some(Repair::QualifierStripped {
                        key: key.expr.to_sql(),
                    }),
                };
            }
            if let Some(resolution) = self.hoist_column(&column, key, branches) {
                return resolution;
            }
        }

        self.hoist_expression(key, branches, &shared)
    }

    /// Project a catalog column every branch has under its own name.
    fn hoist_column(
        &self,
        column: &ColumnRef,
        key: &OrderKey,
        branches: &mut [SelectBranch],
    ) -> Option<Resolution> {
        let name_taken = branches.iter().any(|b| {
            b.output_names()
                .iter()
                .flatten()
                .any(|n| n.eq_ignore_ascii_case(&column.name))
        });
        if name_taken {
            return None;
        }
        let exprs = branches
            .iter()
            .map(|b| self.branch_column_expr(b, column))
            .collect::<Option<Vec<_>>>()?;
        for (branch, expr) in branches.iter_mut().zip(exprs) {
            branch.projection.push(OutputColumn::new(expr, None));
        }
        Some(Resolution::Rename {
            alias: column.name.clone(),
            repair: Some(Repair::KeyHoisted {
                key: key.expr.to_sql(),
                alias: column.name.clone(),
            }),
        })
    }

    /// Add the key expression to both projections under a synthetic alias.
    fn hoist_expression(
        &self,
        key: &OrderKey,
        branches: &mut [SelectBranch],
        shared: &[Option<String>],
    ) -> Resolution {
        let reused = shared.iter().enumerate().find_map(|(pos, alias)| {
            let alias = alias.as_ref()?;
            branches
                .iter()
                .all(|b| b.projection[pos].expr.same_as(&key.expr))
                .then(|| alias.clone())
        });
        if let Some(alias) = reused {
            return Resolution::Rename {
                alias,
                repair: None,
            };
        }

        let per_branch: Vec<Option<Expr>> = branches
            .iter()
            .map(|b| self.requalify(b, &key.expr))
            .collect();
        if per_branch.iter().all(|e| e.is_none()) {
            return Resolution::Drop;
        }

        let alias = next_order_key(branches);
        for (branch, expr) in branches.iter_mut().zip(per_branch) {
            let expr = expr.unwrap_or_else(Expr::null);
            branch.projection.push(OutputColumn::new(expr, Some(alias.clone())));
        }
        Resolution::Rename {
            alias: alias.clone(),
            repair: Some(Repair::KeyHoisted {
                key: key.expr.to_sql(),
                alias,
            }),
        }
    }

    /// Table owning a column in a branch, trying the key's qualifier first.
    fn owner(&self, branch: &SelectBranch, column: &ColumnRef) -> Option<String> {
        let table = column
            .qualifier
            .as_deref()
            .and_then(|q| branch.resolve_qualifier(q))
            .map(str::to_string)
            .or_else(|| {
                let bare = ColumnRef {
                    qualifier: None,
                    name: column.name.clone(),
                };
                column_table(self.catalog, branch, &bare)
            })?;
        self.catalog.has_column(&table, &column.name).then_some(table)
    }

    fn reference_in(&self, branch: &SelectBranch, table: &str, name: &str) -> Expr {
        if branch.source.joins.is_empty() {
            return Expr::ident(name);
        }
        let binding = branch
            .tables()
            .find(|t| t.name.eq_ignore_ascii_case(table))
            .map(|t| t.binding().to_string())
            .unwrap_or_else(|| table.to_string());
        Expr::qualified(&binding, name)
    }

    fn branch_column_expr(&self, branch: &SelectBranch, column: &ColumnRef) -> Option<Expr> {
        let table = self.owner(branch, column)?;
        Some(self.reference_in(branch, &table, &column.name))
    }

    /// Rewrite every column reference of `expr` into the branch's scope, or
    /// `None` when the branch lacks one of them.
    fn requalify(&self, branch: &SelectBranch, expr: &Expr) -> Option<Expr> {
        let tokens = expr.tokens();
        let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
        let mut idx = 0;
        while idx < tokens.len() {
            let token = &tokens[idx];
            let after_type_marker = idx.checked_sub(1).is_some_and(|p| {
                tokens[p].is_any_keyword(&["AS", "COLLATE"]) || tokens[p].is_op("::")
            });
            let next = tokens.get(idx + 1);
            let is_call = next.is_some_and(|t| t.kind == TokenKind::LParen);
            if !token.is_identifier() || after_type_marker || is_call {
                out.push(token.clone());
                idx += 1;
                continue;
            }
            let qualified = next.is_some_and(|t| t.kind == TokenKind::Dot)
                && tokens.get(idx + 2).is_some_and(|t| t.is_identifier());
            let (column, width) = if qualified {
                (
                    ColumnRef {
                        qualifier: token.ident_name(),
                        name: tokens[idx + 2].ident_name()?,
                    },
                    3,
                )
            } else {
                (
                    ColumnRef {
                        qualifier: None,
                        name: token.ident_name()?,
                    },
                    1,
                )
            };
            let rewritten = self.branch_column_expr(branch, &column)?;
            out.extend(rewritten.tokens().iter().cloned());
            idx += width;
        }
        Some(Expr::new(out))
    }
}

/// Alias at each position when both branches project the same name there.
fn shared_aliases(branches: &[SelectBranch]) -> Vec<Option<String>> {
    let left = branches[0].output_names();
    let right = branches[1].output_names();
    left.into_iter()
        .zip(right)
        .map(|(l, r)| match (l, r) {
            (Some(l), Some(r)) if l.eq_ignore_ascii_case(&r) => Some(l),
            _ => None,
        })
        .collect()
}

fn next_order_key(branches: &[SelectBranch]) -> String {
    let taken: Vec<String> = branches
        .iter()
        .flat_map(|b| b.output_names())
        .flatten()
        .map(|n| n.to_lowercase())
        .collect();
    let mut n = 1;
    loop {
        let candidate = format!("{}{}", ORDER_KEY_PREFIX, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ParsedStatement;
    use crate::parser::parse;

    fn resolved(sql: &str) -> (String, Vec<Repair>) {
        let catalog = SchemaCatalog::inventory();
        let mut query = match parse(sql) {
            ParsedStatement::Query(q) => q,
            ParsedStatement::Rejected(r) => panic!("{r}"),
        };
        let repairs = OrderByResolver::new(&catalog).resolve(&mut query);
        (query.to_sql(), repairs)
    }

    #[test]
    fn test_qualifier_is_stripped_for_shared_alias() {
        let (sql, repairs) = resolved(
            "SELECT c.mark, c.model FROM cars c UNION ALL SELECT u.mark, u.model FROM used_cars u ORDER BY c.mark",
        );
        assert!(sql.ends_with("ORDER BY mark"));
        assert_eq!(
            repairs,
            vec![Repair::QualifierStripped {
                key: "c.mark".to_string()
            }]
        );
    }

    #[test]
    fn test_expression_key_is_hoisted() {
        let (sql, _) = resolved(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY LENGTH(model) DESC",
        );
        assert_eq!(
            sql,
            "SELECT mark, LENGTH(model) AS order_key_1 FROM cars UNION ALL \
             SELECT mark, LENGTH(model) AS order_key_1 FROM used_cars ORDER BY order_key_1 DESC"
        );
    }

    #[test]
    fn test_existing_expression_alias_is_reused() {
        let (sql, repairs) = resolved(
            "SELECT mark, UPPER(model) AS m FROM cars UNION ALL SELECT mark, UPPER(model) AS m FROM used_cars \
             ORDER BY UPPER(model)",
        );
        assert!(sql.ends_with("ORDER BY m"));
        assert!(repairs.is_empty());
    }

    #[test]
    fn test_missing_column_is_padded_with_null() {
        let (sql, _) = resolved(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY mileage * 2",
        );
        assert!(sql.contains("SELECT mark, NULL AS order_key_1 FROM cars"));
        assert!(sql.contains("SELECT mark, mileage * 2 AS order_key_1 FROM used_cars"));
    }

    #[test]
    fn test_catalog_column_present_everywhere_is_hoisted() {
        let (sql, _) = resolved(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY model",
        );
        assert_eq!(
            sql,
            "SELECT mark, model FROM cars UNION ALL SELECT mark, model FROM used_cars ORDER BY model"
        );
    }

    #[test]
    fn test_positions() {
        let (sql, _) = resolved("SELECT mark, model FROM cars UNION ALL SELECT mark, model FROM used_cars ORDER BY 2");
        assert!(sql.ends_with("ORDER BY model"));
        let (sql, repairs) =
            resolved("SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY 5");
        assert!(!sql.contains("ORDER BY"));
        assert_eq!(repairs, vec![Repair::KeyDropped { key: "5".to_string() }]);
    }

    #[test]
    fn test_collation_survives_key_resolution() {
        let (sql, repairs) = resolved(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY mark COLLATE NOCASE",
        );
        assert!(sql.ends_with("ORDER BY mark COLLATE NOCASE"), "{sql}");
        assert!(repairs.is_empty());

        let (sql, _) = resolved(
            "SELECT c.mark FROM cars c UNION ALL SELECT u.mark FROM used_cars u ORDER BY c.mark COLLATE NOCASE DESC",
        );
        assert!(sql.ends_with("ORDER BY mark COLLATE NOCASE DESC"), "{sql}");

        let (sql, _) = resolved(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY model COLLATE NOCASE",
        );
        assert_eq!(
            sql,
            "SELECT mark, model FROM cars UNION ALL SELECT mark, model FROM used_cars ORDER BY model COLLATE NOCASE"
        );
    }

    #[test]
    fn test_unresolvable_key_is_dropped() {
        let (sql, repairs) =
            resolved("SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY nonsense");
        assert!(!sql.contains("ORDER BY"));
        assert!(matches!(repairs[0], Repair::KeyDropped { .. }));
    }

    #[test]
    fn test_per_branch_limit_is_wrapped() {
        let (sql, repairs) = resolved(
            "SELECT mark, price FROM cars ORDER BY price LIMIT 10 UNION ALL \
             SELECT mark, price FROM used_cars ORDER BY price LIMIT 10",
        );
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT mark, price FROM cars ORDER BY price LIMIT 10) AS branch_1 UNION ALL \
             SELECT * FROM (SELECT mark, price FROM used_cars ORDER BY price LIMIT 10) AS branch_2"
        );
        assert_eq!(repairs.len(), 2);
    }

    #[test]
    fn test_per_branch_order_without_limit_is_lifted() {
        let (sql, repairs) = resolved(
            "(SELECT mark FROM cars ORDER BY mark) UNION ALL SELECT mark FROM used_cars",
        );
        assert_eq!(sql, "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY mark");
        assert_eq!(repairs, vec![Repair::OrderLifted { branch: 0 }]);
    }

    #[test]
    fn test_single_branch_is_untouched() {
        let (sql, repairs) = resolved("SELECT c.mark FROM cars c ORDER BY c.mark LIMIT 3");
        assert_eq!(sql, "SELECT c.mark FROM cars AS c ORDER BY c.mark LIMIT 3");
        assert!(repairs.is_empty());
    }

    #[test]
    fn test_synthetic_alias_skips_taken_names() {
        let (sql, _) = resolved(
            "SELECT mark, 1 AS order_key_1 FROM cars UNION ALL SELECT mark, 2 AS order_key_1 FROM used_cars \
             ORDER BY LENGTH(mark)",
        );
        assert!(sql.ends_with("ORDER BY order_key_2"));
    }
}
