//! Terminal rendering shared by the commands.

use carquery_sql::{Outcome, Repair};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use serde_json::Value;

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    for row in rows {
        table.add_row(row);
    }
    println!("{}", table);
}

/// Display form of a result cell.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Human-readable outcome: the SQL on stdout, a rejection on stderr.
pub fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Accepted { sql } => println!("{}", sql),
        Outcome::Rejected {
            reason,
            message,
            offending_fragment,
        } => {
            eprintln!("Rejected [{}]: {}", reason, message);
            if let Some(fragment) = offending_fragment {
                eprintln!("  near: {}", fragment);
            }
        }
    }
}

pub fn print_repairs(repairs: &[Repair]) {
    if repairs.is_empty() {
        eprintln!("-- no repairs applied");
    }
    for repair in repairs {
        eprintln!("-- {}", repair);
    }
}
