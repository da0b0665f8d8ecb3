//! Safety and repair engine for generated inventory SQL.
//!
//! Candidate statements go through a fixed pipeline:
//! parse, safety validation, numeric cast normalization, UNION ALL column
//! alignment, ORDER BY resolution and a final revalidation of the rendered SQL.
//! The caller gets either repaired SQL or a typed rejection.
//!
//! ```
//! use carquery_sql::{validate_and_repair, Outcome, SchemaCatalog};
//!
//! let catalog = SchemaCatalog::inventory();
//! let outcome = validate_and_repair(
//!     "SELECT mark, model FROM cars UNION ALL SELECT mark, model, mileage FROM used_cars",
//!     &catalog,
//! );
//! assert_eq!(
//!     outcome.sql(),
//!     Some("SELECT mark, model, NULL AS mileage FROM cars UNION ALL SELECT mark, model, mileage FROM used_cars")
//! );
//! ```

pub mod ast;
pub mod catalog;
pub mod error;
pub mod lexer;
pub mod numeric;
pub mod order_by;
pub mod parser;
pub mod pipeline;
pub mod safety;
pub mod union;

pub use ast::{OrderSpec, OutputColumn, ParsedStatement, SelectBranch, UnionQuery};
pub use catalog::{CatalogError, CatalogSpec, ColumnDef, LogicalType, SchemaCatalog, TableSpec};
pub use error::{ReasonCode, Rejection, RepairError};
pub use numeric::{CastStyle, NumericCastNormalizer};
pub use order_by::OrderByResolver;
pub use parser::parse;
pub use pipeline::{validate_and_repair, Outcome, PipelineReport, Repair, RepairPipeline, Stage};
pub use safety::SafetyValidator;
pub use union::UnionAligner;
