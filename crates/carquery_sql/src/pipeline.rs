//! Fixed-order repair pipeline and its public entry point.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ast::UnionQuery;
use crate::catalog::SchemaCatalog;
use crate::error::{ReasonCode, Rejection};
use crate::numeric::{CastStyle, NumericCastNormalizer};
use crate::order_by::OrderByResolver;
use crate::safety::SafetyValidator;
use crate::union::UnionAligner;

/// Pipeline states, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Parsed,
    Validated,
    Normalized,
    Aligned,
    Resolved,
    Revalidated,
    Done,
    Rejected,
}

/// A silent structural repair applied on the way to an accepted statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Repair {
    NumericCast { count: usize },
    StarExpanded { branch: usize },
    ColumnsPadded { branch: usize, columns: Vec<String> },
    ColumnsReordered { branch: usize },
    AliasesAligned { branch: usize, positions: Vec<usize> },
    QualifierStripped { key: String },
    PositionAliased { position: usize, alias: String },
    KeyHoisted { key: String, alias: String },
    BranchWrapped { branch: usize, alias: String },
    OrderLifted { branch: usize },
    KeyDropped { key: String },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::NumericCast { count } => write!(f, "cast {} numeric text reference(s)", count),
            Repair::StarExpanded { branch } => write!(f, "expanded * in branch {}", branch + 1),
            Repair::ColumnsPadded { branch, columns } => {
                write!(f, "padded branch {} with NULL AS {}", branch + 1, columns.join(", "))
            }
            Repair::ColumnsReordered { branch } => write!(f, "reordered columns of branch {}", branch + 1),
            Repair::AliasesAligned { branch, positions } => {
                let positions: Vec<String> = positions.iter().map(|p| p.to_string()).collect();
                write!(
                    f,
                    "renamed branch {} columns at position(s) {}",
                    branch + 1,
                    positions.join(", ")
                )
            }
            Repair::QualifierStripped { key } => write!(f, "stripped qualifier from ORDER BY {}", key),
            Repair::PositionAliased { position, alias } => {
                write!(f, "ORDER BY {} now refers to {}", position, alias)
            }
            Repair::KeyHoisted { key, alias } => write!(f, "hoisted ORDER BY {} as {}", key, alias),
            Repair::BranchWrapped { branch, alias } => {
                write!(f, "wrapped branch {} in derived table {}", branch + 1, alias)
            }
            Repair::OrderLifted { branch } => {
                write!(f, "moved ORDER BY of branch {} after the union", branch + 1)
            }
            Repair::KeyDropped { key } => write!(f, "dropped ORDER BY {}", key),
        }
    }
}

/// Final result handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Accepted {
        sql: String,
    },
    Rejected {
        reason: ReasonCode,
        message: String,
        offending_fragment: Option<String>,
    },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Outcome::Accepted { sql } => Some(sql),
            Outcome::Rejected { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Outcome::Accepted { .. } => None,
            Outcome::Rejected { reason, .. } => Some(*reason),
        }
    }
}

impl From<Rejection> for Outcome {
    fn from(rejection: Rejection) -> Self {
        Outcome::Rejected {
            reason: rejection.reason,
            message: rejection.message,
            offending_fragment: rejection.offending_fragment,
        }
    }
}

/// Outcome plus the diagnostics gathered while producing it.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub outcome: Outcome,
    pub repairs: Vec<Repair>,
    pub stages: Vec<Stage>,
}

pub struct RepairPipeline<'a> {
    catalog: &'a SchemaCatalog,
    style: CastStyle,
}

impl<'a> RepairPipeline<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self {
            catalog,
            style: CastStyle::default(),
        }
    }

    pub fn with_cast_style(mut self, style: CastStyle) -> Self {
        self.style = style;
        self
    }

    /// Run every stage exactly once.
    pub fn run(&self, sql: &str) -> PipelineReport {
        let mut run = Run::default();
        let validator = SafetyValidator::new(self.catalog);

        let mut query = match validator.validate_sql(sql) {
            Ok(query) => query,
            Err(rejection) => return run.reject(rejection),
        };
        run.enter(Stage::Parsed);
        run.enter(Stage::Validated);

        let count = NumericCastNormalizer::new(self.catalog, &self.style).normalize(&mut query);
        if count > 0 {
            run.repaired(Repair::NumericCast { count });
        }
        run.enter(Stage::Normalized);

        match UnionAligner::new(self.catalog).align(&mut query) {
            Ok(repairs) => repairs.into_iter().for_each(|r| run.repaired(r)),
            Err(err) => return run.reject(err.into()),
        }
        run.enter(Stage::Aligned);

        for repair in OrderByResolver::new(self.catalog).resolve(&mut query) {
            run.repaired(repair);
        }
        run.enter(Stage::Resolved);

        let repaired = query.to_sql();
        if let Err(rejection) = self.revalidate(&repaired) {
            return run.reject(rejection);
        }
        run.enter(Stage::Revalidated);
        run.enter(Stage::Done);

        PipelineReport {
            outcome: Outcome::Accepted { sql: repaired },
            repairs: run.repairs,
            stages: run.stages,
        }
    }

    fn revalidate(&self, sql: &str) -> Result<(), Rejection> {
        let query = SafetyValidator::new(self.catalog)
            .validate_sql(sql)
            .map_err(|r| {
                Rejection::internal(format!("Repaired SQL failed revalidation: {}", r.message))
                    .with_fragment(sql)
            })?;
        check_invariants(&query).map_err(|message| Rejection::internal(message).with_fragment(sql))
    }
}

fn check_invariants(query: &UnionQuery) -> Result<(), String> {
    if query.branches.len() != 2 {
        return Ok(());
    }
    let left = query.branches[0].output_names();
    let right = query.branches[1].output_names();
    if left.len() != right.len() {
        return Err(format!(
            "UNION ALL branches project {} and {} columns",
            left.len(),
            right.len()
        ));
    }
    let Some(order) = &query.order_by else {
        return Ok(());
    };
    for key in &order.keys {
        let (expr, _) = key.expr.split_collation();
        if let Some(position) = expr.position() {
            if position <= left.len() {
                continue;
            }
        } else if let Some(column) = expr.column_ref() {
            let shared = left.iter().zip(right.iter()).any(|(l, r)| match (l, r) {
                (Some(l), Some(r)) => {
                    l.eq_ignore_ascii_case(&column.name) && r.eq_ignore_ascii_case(&column.name)
                }
                _ => false,
            });
            if column.qualifier.is_none() && shared {
                continue;
            }
        }
        return Err(format!(
            "ORDER BY key `{}` does not resolve to an alias shared by both branches",
            key.expr.to_sql()
        ));
    }
    Ok(())
}

#[derive(Default)]
struct Run {
    repairs: Vec<Repair>,
    stages: Vec<Stage>,
}

impl Run {
    fn enter(&mut self, stage: Stage) {
        debug!(stage = ?stage, "pipeline transition");
        self.stages.push(stage);
    }

    fn repaired(&mut self, repair: Repair) {
        debug!(repair = %repair, "applied repair");
        self.repairs.push(repair);
    }

    fn reject(mut self, rejection: Rejection) -> PipelineReport {
        info!(
            reason = %rejection.reason,
            message = %rejection.message,
            "candidate SQL rejected"
        );
        self.enter(Stage::Rejected);
        PipelineReport {
            outcome: rejection.into(),
            repairs: self.repairs,
            stages: self.stages,
        }
    }
}

/// Validate candidate SQL and repair structural issues.
///
/// Returns the repaired statement, or a typed rejection when the candidate is
/// unsafe or outside the supported grammar.
pub fn validate_and_repair(candidate_sql: &str, schema: &SchemaCatalog) -> Outcome {
    RepairPipeline::new(schema).run(candidate_sql).outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_run_visits_every_stage() {
        let catalog = SchemaCatalog::inventory();
        let report = RepairPipeline::new(&catalog).run("SELECT mark FROM cars");
        assert!(report.outcome.is_accepted());
        assert_eq!(
            report.stages,
            vec![
                Stage::Parsed,
                Stage::Validated,
                Stage::Normalized,
                Stage::Aligned,
                Stage::Resolved,
                Stage::Revalidated,
                Stage::Done
            ]
        );
        assert!(report.repairs.is_empty());
    }

    #[test]
    fn test_rejection_stops_the_pipeline() {
        let catalog = SchemaCatalog::inventory();
        let report = RepairPipeline::new(&catalog).run("DELETE FROM cars");
        assert_eq!(report.outcome.reason(), Some(ReasonCode::ForbiddenVerb));
        assert_eq!(report.stages, vec![Stage::Rejected]);
    }

    #[test]
    fn test_unaliased_column_surfaces_as_unsupported() {
        let catalog = SchemaCatalog::inventory();
        let outcome = validate_and_repair(
            "SELECT mark FROM cars UNION ALL SELECT mark, COUNT(*) FROM used_cars GROUP BY mark",
            &catalog,
        );
        match outcome {
            Outcome::Rejected {
                reason,
                offending_fragment,
                ..
            } => {
                assert_eq!(reason, ReasonCode::UnsupportedSyntax);
                assert_eq!(offending_fragment.as_deref(), Some("COUNT(*)"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_invariant_check_flags_dangling_key() {
        let query = match crate::parser::parse(
            "SELECT mark FROM cars UNION ALL SELECT mark FROM used_cars ORDER BY c.mark",
        ) {
            crate::ast::ParsedStatement::Query(q) => q,
            crate::ast::ParsedStatement::Rejected(r) => panic!("{r}"),
        };
        assert!(check_invariants(&query).is_err());
    }

    #[test]
    fn test_custom_cast_style() {
        let catalog = SchemaCatalog::inventory();
        let style = CastStyle {
            strip: vec![],
            decimal_comma: false,
            cast_type: "NUMERIC".to_string(),
        };
        let report = RepairPipeline::new(&catalog)
            .with_cast_style(style)
            .run("SELECT mark FROM cars WHERE price > 5");
        assert_eq!(
            report.outcome.sql(),
            Some("SELECT mark FROM cars WHERE CAST(price AS NUMERIC) > 5")
        );
        assert_eq!(report.repairs, vec![Repair::NumericCast { count: 1 }]);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = Outcome::Accepted {
            sql: "SELECT 1".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["sql"], "SELECT 1");
    }
}
