//! `carquery schema` - show the active catalog.

use anyhow::Result;
use carquery_sql::{LogicalType, SchemaCatalog};

use crate::cli::config::CarqueryConfig;
use crate::cli::output::print_table;

pub fn run(json: bool, config: &CarqueryConfig) -> Result<()> {
    let catalog = config.catalog()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&catalog.to_spec())?);
        return Ok(());
    }

    print_table(&["Table", "Column", "Type"], column_rows(&catalog));
    let pairs: Vec<Vec<String>> = catalog
        .incompatible_pairs()
        .map(|(a, b)| vec![a.to_string(), b.to_string()])
        .collect();
    if !pairs.is_empty() {
        println!();
        println!("Tables that must never be joined:");
        print_table(&["Table", "Table"], pairs);
    }
    Ok(())
}

fn column_rows(catalog: &SchemaCatalog) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for table in catalog.table_names() {
        for column in catalog.columns(table).unwrap_or_default() {
            rows.push(vec![
                table.to_string(),
                column.name.clone(),
                type_label(column.logical_type).to_string(),
            ]);
        }
    }
    rows
}

fn type_label(ty: LogicalType) -> &'static str {
    match ty {
        LogicalType::Text => "text",
        LogicalType::NumericText => "numeric text",
        LogicalType::Integer => "integer",
        LogicalType::Unknown => "unknown",
    }
}
