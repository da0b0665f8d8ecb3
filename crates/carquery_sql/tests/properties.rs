//! Property tests for the safety and repair guarantees.

use carquery_sql::ast::ParsedStatement;
use carquery_sql::{parse, validate_and_repair, Outcome, ReasonCode, SchemaCatalog};
use proptest::prelude::*;

/// Columns declared by both `cars` and `used_cars`.
const SHARED_COLUMNS: &[&str] = &[
    "mark", "model", "vin", "color", "city", "body_type", "fuel_type", "power", "price",
];

const VERBS: &[&str] = &["DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "EXEC"];

const INCOMPATIBLE: &[(&str, &str)] = &[
    ("cars", "used_cars"),
    ("used_cars", "car_options"),
    ("used_cars", "car_pictures"),
    ("cars", "used_car_pictures"),
];

fn catalog() -> SchemaCatalog {
    SchemaCatalog::inventory()
}

fn case(word: &str, lower: bool) -> String {
    if lower {
        word.to_lowercase()
    } else {
        word.to_string()
    }
}

fn reparsed(sql: &str) -> carquery_sql::UnionQuery {
    match parse(sql) {
        ParsedStatement::Query(q) => q,
        ParsedStatement::Rejected(r) => panic!("output does not re-parse: {sql}: {r}"),
    }
}

/// A longer branch and a shuffled proper subset of it.
fn shorter_shuffled_first_branch() -> impl Strategy<Value = (Vec<&'static str>, Vec<&'static str>)> {
    prop::sample::subsequence(SHARED_COLUMNS, 2..=6)
        .prop_flat_map(|long| {
            let n = long.len();
            (prop::sample::subsequence(long.clone(), 1..n), Just(long).prop_shuffle())
        })
        .prop_flat_map(|(short, long)| (Just(short).prop_shuffle(), Just(long)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A forbidden verb anywhere outside a literal always wins.
    #[test]
    fn test_forbidden_verb_is_always_rejected(
        verb in prop::sample::select(VERBS),
        lower in any::<bool>(),
        template in 0usize..5,
        column in prop::sample::select(SHARED_COLUMNS),
    ) {
        let verb = case(verb, lower);
        let sql = match template {
            0 => format!("{verb} TABLE cars"),
            1 => format!("SELECT {column} FROM cars; {verb} FROM cars"),
            2 => format!("SELECT {column} FROM cars WHERE {verb} = 1"),
            3 => format!("SELECT {column} FROM cars UNION ALL SELECT {column} FROM used_cars {verb}"),
            _ => format!("SELECT {column} FROM cars WHERE '{column}' = 'x' /* ok */ AND {verb}(1) = 1 AND 'unterminated"),
        };
        let outcome = validate_and_repair(&sql, &catalog());
        prop_assert_eq!(outcome.reason(), Some(ReasonCode::ForbiddenVerb), "{}", sql);
    }

    /// The same verbs inside string literals do not trigger rejection.
    #[test]
    fn test_verbs_inside_literals_are_harmless(
        verb in prop::sample::select(VERBS),
        column in prop::sample::select(SHARED_COLUMNS),
    ) {
        let sql = format!("SELECT {column} FROM cars WHERE city = '{verb} everything'");
        let outcome = validate_and_repair(&sql, &catalog());
        prop_assert!(outcome.is_accepted(), "{:?}", outcome);
    }

    /// Joining an incompatible pair is rejected with or without a UNION ALL
    /// elsewhere, and even when the right table is wrapped in parentheses.
    #[test]
    fn test_incompatible_join_is_always_rejected(
        pair in prop::sample::select(INCOMPATIBLE),
        swap in any::<bool>(),
        join in prop::sample::select(&["JOIN", "INNER JOIN", "LEFT JOIN", "CROSS JOIN", ","][..]),
        suffix in 0usize..3,
        grouped in any::<bool>(),
    ) {
        let (left, right) = if swap { (pair.1, pair.0) } else { (pair.0, pair.1) };
        let right = if grouped { format!("({right})") } else { right.to_string() };
        let on = if join == "," || join == "CROSS JOIN" { "" } else { " ON a.id = b.id" };
        let tail = match suffix {
            0 => "",
            1 => " UNION ALL SELECT id FROM cars",
            _ => " UNION SELECT id FROM cars",
        };
        let sql = format!("SELECT a.id FROM {left} a {join} {right} b{on}{tail}");
        let outcome = validate_and_repair(&sql, &catalog());
        prop_assert_eq!(outcome.reason(), Some(ReasonCode::IllegalJoin), "{}", sql);
    }

    /// Mismatched projections come out with equal lengths of max(m, n).
    #[test]
    fn test_union_branches_are_aligned(
        left in prop::sample::subsequence(SHARED_COLUMNS, 1..=SHARED_COLUMNS.len()),
        right in prop::sample::subsequence(SHARED_COLUMNS, 1..=SHARED_COLUMNS.len()),
        mileage in any::<bool>(),
    ) {
        let mut right: Vec<&str> = right;
        if mileage {
            right.push("mileage");
        }
        let sql = format!(
            "SELECT {} FROM cars UNION ALL SELECT {} FROM used_cars",
            left.join(", "),
            right.join(", ")
        );
        let outcome = validate_and_repair(&sql, &catalog());
        let repaired = outcome.sql().unwrap_or_else(|| panic!("rejected {sql}: {outcome:?}")).to_string();
        let query = reparsed(&repaired);
        let width = left.len().max(right.len());
        prop_assert_eq!(query.branches.len(), 2);
        prop_assert_eq!(query.branches[0].projection.len(), width);
        prop_assert_eq!(query.branches[1].projection.len(), width);
        let names0 = query.branches[0].output_names();
        let names1 = query.branches[1].output_names();
        prop_assert_eq!(names0, names1);
    }

    /// Every outer ORDER BY key of a repaired union is a bare shared alias or a
    /// valid position, and a second pass changes nothing.
    #[test]
    fn test_order_by_keys_resolve_and_repair_is_idempotent(
        columns in prop::sample::subsequence(SHARED_COLUMNS, 1..=4),
        key_kind in 0usize..6,
        key_column in prop::sample::select(SHARED_COLUMNS),
        desc in any::<bool>(),
    ) {
        let cols_c: Vec<String> = columns.iter().map(|c| format!("c.{c}")).collect();
        let cols_u: Vec<String> = columns.iter().map(|c| format!("u.{c}")).collect();
        let key = match key_kind {
            0 => format!("c.{key_column}"),
            1 => key_column.to_string(),
            2 => format!("{}", (key_column.len() % columns.len()) + 1),
            3 => format!("LENGTH(u.{key_column})"),
            4 => "mileage".to_string(),
            _ => format!("UPPER({key_column}) || c.{key_column}"),
        };
        let direction = if desc { " DESC" } else { "" };
        let sql = format!(
            "SELECT {} FROM cars c UNION ALL SELECT {} FROM used_cars u ORDER BY {key}{direction}",
            cols_c.join(", "),
            cols_u.join(", ")
        );
        let catalog = catalog();
        let once = validate_and_repair(&sql, &catalog);
        let repaired = once.sql().unwrap_or_else(|| panic!("rejected {sql}: {once:?}")).to_string();

        let query = reparsed(&repaired);
        let names0 = query.branches[0].output_names();
        let names1 = query.branches[1].output_names();
        if let Some(order) = &query.order_by {
            for key in &order.keys {
                if let Some(position) = key.expr.position() {
                    prop_assert!(position <= names0.len());
                    continue;
                }
                let column = key.expr.column_ref();
                prop_assert!(column.as_ref().is_some_and(|c| c.qualifier.is_none()), "{}", repaired);
                let name = column.map(|c| c.name).unwrap_or_default();
                prop_assert!(names0.iter().flatten().any(|n| n.eq_ignore_ascii_case(&name)));
                prop_assert!(names1.iter().flatten().any(|n| n.eq_ignore_ascii_case(&name)));
            }
        }

        let twice = validate_and_repair(&repaired, &catalog);
        prop_assert_eq!(twice, Outcome::Accepted { sql: repaired });
    }

    /// A shorter branch 0 keeps its column order, so a positional key still
    /// sorts by the column it named before padding.
    #[test]
    fn test_positional_key_survives_padding_of_first_branch(
        (short, long) in shorter_shuffled_first_branch(),
        position in any::<prop::sample::Index>(),
        desc in any::<bool>(),
    ) {
        let position = position.index(short.len()) + 1;
        let target = short[position - 1];
        let direction = if desc { " DESC" } else { "" };
        let sql = format!(
            "SELECT {} FROM cars UNION ALL SELECT {} FROM used_cars ORDER BY {position}{direction}",
            short.join(", "),
            long.join(", ")
        );
        let catalog = catalog();
        let once = validate_and_repair(&sql, &catalog);
        let repaired = once.sql().unwrap_or_else(|| panic!("rejected {sql}: {once:?}")).to_string();

        let query = reparsed(&repaired);
        let names0 = query.branches[0].output_names();
        let leading: Vec<String> = names0[..short.len()].iter().flatten().cloned().collect();
        prop_assert_eq!(leading, short.iter().map(|c| c.to_string()).collect::<Vec<_>>(), "{}", repaired);

        let order = query.order_by.as_ref().unwrap_or_else(|| panic!("sort lost: {repaired}"));
        prop_assert_eq!(order.keys.len(), 1);
        let key = &order.keys[0].expr;
        let slot = match key.position() {
            Some(p) => p - 1,
            None => {
                let alias = key.column_ref().map(|c| c.name).unwrap_or_default();
                names0
                    .iter()
                    .position(|n| n.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(&alias)))
                    .unwrap_or_else(|| panic!("key {alias} not projected: {repaired}"))
            }
        };
        for branch in &query.branches {
            let refs = branch.projection[slot].expr.column_refs();
            prop_assert!(refs.iter().any(|r| r.name == target), "{} -> {}", sql, repaired);
        }

        let twice = validate_and_repair(&repaired, &catalog);
        prop_assert_eq!(twice, Outcome::Accepted { sql: repaired });
    }
}
