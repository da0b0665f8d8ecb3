//! Schema catalog: tables, column logical types and incompatible table pairs.
//!
//! The catalog is built once at startup and shared by reference. All lookups
//! are case-insensitive and never fail: unknown names resolve to
//! [`LogicalType::Unknown`] so schema drift degrades repairs instead of
//! aborting them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Logical type of a column as far as repairs are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Text,
    /// Stored as text, compared as a number (prices with currency symbols).
    NumericText,
    Integer,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
        }
    }
}

/// Errors raised while building a catalog from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Table declared twice: {0}")]
    DuplicateTable(String),

    #[error("Column {column} declared twice in table {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("Incompatible pair references a table with itself: {0}")]
    SelfIncompatible(String),
}

/// Serialisable description of a catalog (the `[catalog]` config section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
    #[serde(default)]
    pub incompatible: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

/// Read-only lookup table over the inventory schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableEntry>,
    incompatible: BTreeSet<(String, String)>,
}

#[derive(Debug, Clone)]
struct TableEntry {
    name: String,
    columns: Vec<ColumnDef>,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = (key(a), key(b));
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a table definition.
    pub fn with_table(mut self, name: &str, columns: Vec<ColumnDef>) -> Self {
        self.tables.insert(
            key(name),
            TableEntry {
                name: name.to_string(),
                columns,
            },
        );
        self
    }

    /// Declare that two tables must never be joined.
    pub fn with_incompatible(mut self, a: &str, b: &str) -> Self {
        self.incompatible.insert(pair_key(a, b));
        self
    }

    pub fn column_type(&self, table: &str, column: &str) -> LogicalType {
        self.column(table, column)
            .map(|c| c.logical_type)
            .unwrap_or(LogicalType::Unknown)
    }

    pub fn is_incompatible_join(&self, table_a: &str, table_b: &str) -> bool {
        self.incompatible.contains(&pair_key(table_a, table_b))
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&key(table))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    /// Ordered column list of a table, if known.
    pub fn columns(&self, table: &str) -> Option<&[ColumnDef]> {
        self.tables.get(&key(table)).map(|t| t.columns.as_slice())
    }

    /// Declared table names, in catalog order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.values().map(|t| t.name.as_str())
    }

    pub fn incompatible_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.incompatible.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    fn column(&self, table: &str, column: &str) -> Option<&ColumnDef> {
        let column = column.trim();
        self.tables
            .get(&key(table))?
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
    }

    /// Convert back to the serialisable form.
    pub fn to_spec(&self) -> CatalogSpec {
        CatalogSpec {
            tables: self
                .tables
                .values()
                .map(|t| {
                    (
                        t.name.clone(),
                        TableSpec {
                            columns: t.columns.clone(),
                        },
                    )
                })
                .collect(),
            incompatible: self.incompatible.iter().cloned().collect(),
        }
    }

    /// The dealership inventory schema: new cars, used cars and their
    /// satellite tables.
    pub fn inventory() -> Self {
        use LogicalType::{Integer as I, NumericText as N, Text as T};

        fn cols(defs: &[(&str, LogicalType)]) -> Vec<ColumnDef> {
            defs.iter().map(|(n, t)| ColumnDef::new(*n, *t)).collect()
        }

        let cars = cols(&[
            ("id", I),
            ("title", T),
            ("doc_num", T),
            ("stock_qty", I),
            ("mark", T),
            ("model", T),
            ("code_compl", T),
            ("vin", T),
            ("color", T),
            ("price", N),
            ("city", T),
            ("manufacture_year", I),
            ("fuel_type", T),
            ("power", N),
            ("body_type", T),
            ("gear_box_type", T),
            ("driving_gear_type", T),
            ("engine_vol", I),
            ("dealer_center", T),
            ("interior_color", T),
            ("engine", T),
            ("door_qty", T),
            ("pts_colour", T),
            ("model_year", T),
            ("fuel_consumption", T),
            ("max_torque", T),
            ("acceleration", T),
            ("max_speed", T),
            ("eco_class", T),
            ("dimensions", T),
            ("weight", T),
            ("cargo_volume", T),
            ("compl_level", T),
            ("interior_code", T),
            ("color_code", T),
            ("car_order_int_status", T),
            ("sale_price", N),
            ("max_additional_discount", N),
            ("max_discount_trade_in", N),
            ("max_discount_credit", N),
            ("max_discount_casko", N),
            ("max_discount_extra_gear", N),
            ("max_discount_life_insurance", N),
            ("created_at", T),
            ("updated_at", T),
        ]);

        let used_cars = cols(&[
            ("id", I),
            ("title", T),
            ("doc_num", T),
            ("mark", T),
            ("model", T),
            ("vin", T),
            ("color", T),
            ("price", N),
            ("city", T),
            ("manufacture_year", I),
            ("mileage", I),
            ("body_type", T),
            ("gear_box_type", T),
            ("driving_gear_type", T),
            ("engine_vol", I),
            ("power", N),
            ("fuel_type", T),
            ("dealer_center", T),
            ("date_begin", T),
            ("date_end", T),
            ("ad_status", T),
            ("allow_email", T),
            ("company_name", T),
            ("manager_name", T),
            ("contact_phone", T),
            ("category", T),
            ("region", T),
            ("car_type", T),
            ("accident", T),
            ("certification_number", T),
            ("allow_avtokod_report_link", T),
            ("doors", T),
            ("wheel_type", T),
            ("owners", I),
            ("street", T),
            ("sticker", T),
            ("generation_id", T),
            ("modification_id", T),
            ("dimensions", T),
            ("weight", T),
            ("cargo_volume", T),
            ("aaa_max_additional_discount", N),
            ("aaa_max_discount_trade_in", N),
            ("aaa_max_discount_credit", N),
            ("aaa_max_discount_casko", N),
            ("aaa_max_discount_extra_gear", N),
            ("aaa_max_discount_life_insurance", N),
            ("created_at", T),
            ("updated_at", T),
        ]);

        Self::new()
            .with_table("cars", cars)
            .with_table("used_cars", used_cars)
            .with_table(
                "car_options",
                cols(&[
                    ("id", I),
                    ("car_id", I),
                    ("code", T),
                    ("description", T),
                    ("options_group_id", I),
                    ("created_at", T),
                ]),
            )
            .with_table(
                "car_options_groups",
                cols(&[
                    ("id", I),
                    ("car_id", I),
                    ("code", T),
                    ("name", T),
                    ("created_at", T),
                ]),
            )
            .with_table(
                "car_pictures",
                cols(&[
                    ("id", I),
                    ("car_id", I),
                    ("url", T),
                    ("type", T),
                    ("seqno", I),
                    ("created_at", T),
                ]),
            )
            .with_table(
                "used_car_pictures",
                cols(&[
                    ("id", I),
                    ("used_car_id", I),
                    ("url", T),
                    ("type", T),
                    ("seqno", I),
                    ("created_at", T),
                ]),
            )
            .with_incompatible("cars", "used_cars")
            // Options and pictures of new cars are keyed by cars.id only.
            .with_incompatible("used_cars", "car_options")
            .with_incompatible("used_cars", "car_options_groups")
            .with_incompatible("used_cars", "car_pictures")
            .with_incompatible("cars", "used_car_pictures")
    }
}

impl TryFrom<CatalogSpec> for SchemaCatalog {
    type Error = CatalogError;

    fn try_from(spec: CatalogSpec) -> Result<Self, Self::Error> {
        let mut catalog = SchemaCatalog::new();
        for (name, table) in spec.tables {
            if catalog.has_table(&name) {
                return Err(CatalogError::DuplicateTable(name));
            }
            let mut seen = BTreeSet::new();
            for column in &table.columns {
                if !seen.insert(key(&column.name)) {
                    return Err(CatalogError::DuplicateColumn {
                        table: name.clone(),
                        column: column.name.clone(),
                    });
                }
            }
            catalog = catalog.with_table(&name, table.columns);
        }
        for (a, b) in spec.incompatible {
            if key(&a) == key(&b) {
                return Err(CatalogError::SelfIncompatible(a));
            }
            catalog = catalog.with_incompatible(&a, &b);
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_lookup_is_case_insensitive() {
        let catalog = SchemaCatalog::inventory();
        assert_eq!(catalog.column_type("cars", "price"), LogicalType::NumericText);
        assert_eq!(catalog.column_type("CARS", "Price"), LogicalType::NumericText);
        assert_eq!(catalog.column_type("used_cars", "mileage"), LogicalType::Integer);
        assert_eq!(catalog.column_type("cars", "mark"), LogicalType::Text);
    }

    #[test]
    fn test_unknown_names_degrade_to_unknown() {
        let catalog = SchemaCatalog::inventory();
        assert_eq!(catalog.column_type("cars", "mileage"), LogicalType::Unknown);
        assert_eq!(catalog.column_type("trucks", "price"), LogicalType::Unknown);
        assert!(!catalog.has_table("trucks"));
    }

    #[test]
    fn test_incompatible_pairs_are_unordered() {
        let catalog = SchemaCatalog::inventory();
        assert!(catalog.is_incompatible_join("cars", "used_cars"));
        assert!(catalog.is_incompatible_join("used_cars", "cars"));
        assert!(catalog.is_incompatible_join("Used_Cars", "car_options"));
        assert!(!catalog.is_incompatible_join("cars", "car_options"));
    }

    #[test]
    fn test_columns_preserve_declared_order() {
        let catalog = SchemaCatalog::inventory();
        let cols = catalog.columns("car_options_groups").unwrap();
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "car_id", "code", "name", "created_at"]);
    }

    #[test]
    fn test_catalog_from_spec() {
        let mut spec = CatalogSpec::default();
        spec.tables.insert(
            "a".to_string(),
            TableSpec {
                columns: vec![ColumnDef::new("x", LogicalType::NumericText)],
            },
        );
        spec.tables.insert("b".to_string(), TableSpec::default());
        spec.incompatible.push(("a".to_string(), "b".to_string()));

        let catalog = SchemaCatalog::try_from(spec).unwrap();
        assert_eq!(catalog.column_type("a", "x"), LogicalType::NumericText);
        assert!(catalog.is_incompatible_join("b", "a"));
    }

    #[test]
    fn test_catalog_spec_rejects_duplicates() {
        let mut spec = CatalogSpec::default();
        spec.tables.insert(
            "a".to_string(),
            TableSpec {
                columns: vec![
                    ColumnDef::new("x", LogicalType::Text),
                    ColumnDef::new("X", LogicalType::Text),
                ],
            },
        );
        assert!(matches!(
            SchemaCatalog::try_from(spec),
            Err(CatalogError::DuplicateColumn { .. })
        ));

        let spec = CatalogSpec {
            tables: BTreeMap::new(),
            incompatible: vec![("a".to_string(), "A".to_string())],
        };
        assert!(matches!(
            SchemaCatalog::try_from(spec),
            Err(CatalogError::SelfIncompatible(_))
        ));
    }

    #[test]
    fn test_spec_round_trip_keeps_incompatible_pairs() {
        let spec = SchemaCatalog::inventory().to_spec();
        let rebuilt = SchemaCatalog::try_from(spec).unwrap();
        assert!(rebuilt.is_incompatible_join("cars", "used_cars"));
        assert_eq!(rebuilt.column_type("used_cars", "price"), LogicalType::NumericText);
    }
}
