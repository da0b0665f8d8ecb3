//! Column alignment across the two branches of a UNION ALL.

use std::collections::HashSet;

use tracing::debug;

use crate::ast::{Expr, OutputColumn, SelectBranch, UnionQuery};
use crate::catalog::SchemaCatalog;
use crate::error::RepairError;
use crate::pipeline::Repair;

pub struct UnionAligner<'a> {
    catalog: &'a SchemaCatalog,
}

fn lower(name: &str) -> String {
    name.to_lowercase()
}

fn all_named(names: &[Option<String>]) -> Option<Vec<String>> {
    names.iter().cloned().collect()
}

fn unique(names: &[String]) -> bool {
    let mut seen = HashSet::new();
    names.iter().all(|n| seen.insert(lower(n)))
}

impl<'a> UnionAligner<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    /// Make both branches project the same number of columns under the same
    /// names. Single-branch queries are left alone.
    pub fn align(&self, query: &mut UnionQuery) -> Result<Vec<Repair>, RepairError> {
        let mut repairs = Vec::new();
        if query.branches.len() != 2 {
            return Ok(repairs);
        }

        for (idx, branch) in query.branches.iter_mut().enumerate() {
            if branch.has_star() {
                self.expand_star(branch)?;
                repairs.push(Repair::StarExpanded { branch: idx });
            }
        }

        let left_len = query.branches[0].projection.len();
        let right_len = query.branches[1].projection.len();

        if left_len == right_len {
            if let Some(repair) = reorder_equal(&mut query.branches) {
                repairs.push(repair);
            }
        } else {
            let short_idx = if left_len > right_len { 1 } else { 0 };
            repairs.extend(pad_shorter(&mut query.branches, short_idx)?);
        }

        if let Some(repair) = harmonise_names(&mut query.branches) {
            repairs.push(repair);
        }

        for repair in &repairs {
            debug!(repair = %repair, "union alignment");
        }
        Ok(repairs)
    }

    fn expand_star(&self, branch: &mut SelectBranch) -> Result<(), RepairError> {
        let joined = !branch.source.joins.is_empty();
        let mut expanded = Vec::new();
        for column in &branch.projection {
            match column.expr.star_qualifier() {
                None => expanded.push(column.clone()),
                Some(None) => {
                    for table in branch.tables() {
                        let columns = self.catalog.columns(&table.name).ok_or_else(|| {
                            RepairError::UnknownStarTable {
                                table: table.name.clone(),
                            }
                        })?;
                        for def in columns {
                            let expr = if joined {
                                Expr::qualified(table.binding(), &def.name)
                            } else {
                                Expr::ident(&def.name)
                            };
                            expanded.push(OutputColumn::new(expr, None));
                        }
                    }
                }
                Some(Some(qualifier)) => {
                    let table = branch.resolve_qualifier(&qualifier).ok_or_else(|| {
                        RepairError::UnknownStarTable {
                            table: qualifier.clone(),
                        }
                    })?;
                    let columns = self
                        .catalog
                        .columns(table)
                        .ok_or_else(|| RepairError::UnknownStarTable {
                            table: table.to_string(),
                        })?;
                    for def in columns {
                        expanded.push(OutputColumn::new(Expr::qualified(&qualifier, &def.name), None));
                    }
                }
            }
        }
        branch.projection = expanded;
        Ok(())
    }
}

/// Same count, same name set, different order: follow branch 0.
fn reorder_equal(branches: &mut [SelectBranch]) -> Option<Repair> {
    let left = all_named(&branches[0].output_names())?;
    let right = all_named(&branches[1].output_names())?;
    if !unique(&left) || !unique(&right) {
        return None;
    }
    let in_order = left.iter().zip(right.iter()).all(|(l, r)| lower(l) == lower(r));
    if in_order {
        return None;
    }
    let right_set: HashSet<String> = right.iter().map(|n| lower(n)).collect();
    if !left.iter().all(|n| right_set.contains(&lower(n))) {
        return None;
    }

    let mut pool: Vec<Option<OutputColumn>> = branches[1].projection.drain(..).map(Some).collect();
    let mut reordered = Vec::with_capacity(pool.len());
    for name in &left {
        if let Some(pos) = right.iter().position(|r| lower(r) == lower(name)) {
            if let Some(column) = pool[pos].take() {
                reordered.push(column);
            }
        }
    }
    branches[1].projection = reordered;
    Some(Repair::ColumnsReordered { branch: 1 })
}

/// Branch 0 order defines the output columns, so it is never permuted. A
/// shorter branch 0 gains trailing NULL columns and branch 1 follows it; a
/// shorter branch 1 is rebuilt in branch 0 order.
fn pad_shorter(branches: &mut [SelectBranch], short_idx: usize) -> Result<Vec<Repair>, RepairError> {
    let long_idx = 1 - short_idx;
    let long_names = branches[long_idx].output_names();
    let short_names = branches[short_idx].output_names();

    let subset = match (all_named(&long_names), all_named(&short_names)) {
        (Some(l), Some(s)) if unique(&l) && unique(&s) => {
            let long_set: HashSet<String> = l.iter().map(|n| lower(n)).collect();
            s.iter().all(|n| long_set.contains(&lower(n))).then_some((l, s))
        }
        _ => None,
    };

    if let Some((long_names, short_names)) = subset {
        if short_idx == 0 {
            return Ok(pad_first_branch(branches, &long_names, &short_names));
        }
        let mut repairs = Vec::new();
        let (order, padded) = take_in_order(&mut branches[1], &long_names, &short_names, true);
        if order.windows(2).any(|w| w[0] > w[1]) {
            repairs.push(Repair::ColumnsReordered { branch: 1 });
        }
        repairs.push(Repair::ColumnsPadded {
            branch: 1,
            columns: padded,
        });
        return Ok(repairs);
    }

    let short_len = branches[short_idx].projection.len();
    let tail: Vec<OutputColumn> = branches[long_idx].projection[short_len..].to_vec();
    let mut padded = Vec::new();
    for column in &tail {
        let name = column.output_name().ok_or_else(|| RepairError::UnaliasedColumn {
            expr: column.expr.to_sql(),
        })?;
        branches[short_idx].projection.push(OutputColumn::null_as(&name));
        padded.push(name);
    }
    Ok(vec![Repair::ColumnsPadded {
        branch: short_idx,
        columns: padded,
    }])
}

fn pad_first_branch(branches: &mut [SelectBranch], long_names: &[String], short_names: &[String]) -> Vec<Repair> {
    let mut repairs = Vec::new();
    let mut padded = Vec::new();
    for name in long_names {
        if !short_names.iter().any(|s| lower(s) == lower(name)) {
            branches[0].projection.push(OutputColumn::null_as(name));
            padded.push(name.clone());
        }
    }
    repairs.push(Repair::ColumnsPadded {
        branch: 0,
        columns: padded.clone(),
    });

    let target: Vec<String> = short_names.iter().cloned().chain(padded).collect();
    let (order, _) = take_in_order(&mut branches[1], &target, long_names, false);
    if order.windows(2).any(|w| w[0] > w[1]) {
        repairs.push(Repair::ColumnsReordered { branch: 1 });
    }
    repairs
}

/// Rebuild `branch` so its columns follow `target`. Returns the original
/// positions in their new order and the names that had to be padded.
fn take_in_order(
    branch: &mut SelectBranch,
    target: &[String],
    current: &[String],
    pad: bool,
) -> (Vec<usize>, Vec<String>) {
    let mut pool: Vec<Option<OutputColumn>> = branch.projection.drain(..).map(Some).collect();
    let mut rebuilt = Vec::with_capacity(target.len());
    let mut order = Vec::new();
    let mut padded = Vec::new();
    for name in target {
        let existing = current
            .iter()
            .position(|c| lower(c) == lower(name))
            .and_then(|pos| pool[pos].take().map(|column| (pos, column)));
        match existing {
            Some((pos, column)) => {
                order.push(pos);
                rebuilt.push(column);
            }
            None if pad => {
                rebuilt.push(OutputColumn::null_as(name));
                padded.push(name.clone());
            }
            None => {}
        }
    }
    rebuilt.extend(pool.into_iter().flatten());
    branch.projection = rebuilt;
    (order, padded)
}

/// Give branch 1 the output names of branch 0, position by position.
fn harmonise_names(branches: &mut [SelectBranch]) -> Option<Repair> {
    let names = branches[0].output_names();
    let mut renamed = Vec::new();
    for (position, (column, name)) in branches[1].projection.iter_mut().zip(names.iter()).enumerate() {
        let Some(name) = name else { continue };
        let matches = column
            .output_name()
            .is_some_and(|n| n.eq_ignore_ascii_case(name));
        if !matches {
            column.alias = Some(name.clone());
            renamed.push(position + 1);
        }
    }
    (!renamed.is_empty()).then_some(Repair::AliasesAligned {
        branch: 1,
        positions: renamed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ParsedStatement;
    use crate::error::RepairError;
    use crate::parser::parse;

    fn aligned(sql: &str) -> Result<(String, Vec<Repair>), RepairError> {
        let catalog = SchemaCatalog::inventory();
        let mut query = match parse(sql) {
            ParsedStatement::Query(q) => q,
            ParsedStatement::Rejected(r) => panic!("{r}"),
        };
        let repairs = UnionAligner::new(&catalog).align(&mut query)?;
        Ok((query.to_sql(), repairs))
    }

    #[test]
    fn test_pads_missing_trailing_column() {
        let (sql, repairs) =
            aligned("SELECT mark, model FROM cars UNION ALL SELECT mark, model, mileage FROM used_cars")
                .expect("aligned");
        assert_eq!(
            sql,
            "SELECT mark, model, NULL AS mileage FROM cars UNION ALL SELECT mark, model, mileage FROM used_cars"
        );
        assert_eq!(
            repairs,
            vec![Repair::ColumnsPadded {
                branch: 0,
                columns: vec!["mileage".to_string()]
            }]
        );
    }

    #[test]
    fn test_shorter_first_branch_keeps_its_order() {
        let (sql, repairs) = aligned(
            "SELECT model, mark FROM cars UNION ALL SELECT mark, mileage, model FROM used_cars",
        )
        .expect("aligned");
        assert_eq!(
            sql,
            "SELECT model, mark, NULL AS mileage FROM cars UNION ALL SELECT model, mark, mileage FROM used_cars"
        );
        assert_eq!(
            repairs,
            vec![
                Repair::ColumnsPadded {
                    branch: 0,
                    columns: vec!["mileage".to_string()]
                },
                Repair::ColumnsReordered { branch: 1 },
            ]
        );
    }

    #[test]
    fn test_padding_follows_longer_branch_order() {
        let (sql, _) = aligned(
            "SELECT mark, mileage, model FROM used_cars UNION ALL SELECT model, mark FROM cars",
        )
        .expect("aligned");
        assert!(sql.ends_with("SELECT mark, NULL AS mileage, model FROM cars"));
    }

    #[test]
    fn test_positional_padding_when_names_differ() {
        let (sql, _) = aligned(
            "SELECT mark, price AS cost, mileage FROM used_cars UNION ALL SELECT mark, sale_price FROM cars",
        )
        .expect("aligned");
        assert!(sql.ends_with("SELECT mark, sale_price AS cost, NULL AS mileage FROM cars"));
    }

    #[test]
    fn test_unaliased_computed_column_is_rejected() {
        let err = aligned("SELECT mark FROM cars UNION ALL SELECT mark, UPPER(model) FROM used_cars")
            .expect_err("unaliased");
        assert_eq!(
            err,
            RepairError::UnaliasedColumn {
                expr: "UPPER(model)".to_string()
            }
        );
    }

    #[test]
    fn test_equal_sets_are_reordered() {
        let (sql, repairs) =
            aligned("SELECT mark, model FROM cars UNION ALL SELECT model, mark FROM used_cars").expect("aligned");
        assert!(sql.ends_with("SELECT mark, model FROM used_cars"));
        assert_eq!(repairs, vec![Repair::ColumnsReordered { branch: 1 }]);
    }

    #[test]
    fn test_aligned_input_is_untouched() {
        let (_, repairs) =
            aligned("SELECT mark, model FROM cars UNION ALL SELECT mark, model FROM used_cars").expect("aligned");
        assert!(repairs.is_empty());
    }

    #[test]
    fn test_star_expansion() {
        let (sql, repairs) =
            aligned("SELECT * FROM car_pictures UNION ALL SELECT * FROM used_car_pictures").expect("aligned");
        assert!(matches!(repairs[0], Repair::StarExpanded { branch: 0 }));
        assert!(!sql.contains('*'));
    }

    #[test]
    fn test_star_on_unknown_table_fails() {
        let err = aligned("SELECT * FROM mystery UNION ALL SELECT mark FROM cars").expect_err("unknown");
        assert!(matches!(err, RepairError::UnknownStarTable { .. }));
    }

    #[test]
    fn test_single_branch_is_noop() {
        let (sql, repairs) = aligned("SELECT * FROM mystery").expect("noop");
        assert_eq!(sql, "SELECT * FROM mystery");
        assert!(repairs.is_empty());
    }
}
