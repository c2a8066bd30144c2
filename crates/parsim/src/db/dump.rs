//! Fixed-width textual dump of a query result, for debugging sessions and
//! table-level comparisons in tests.

use crate::{
    db::EventStore,
    error::{ErrorOrigin, PipelineError},
};
use rusqlite::types::ValueRef;
use std::fmt::Write as _;

const CELL_WIDTH: usize = 14;
const SEPARATOR: &str = "  ";

impl EventStore {
    /// Render the result of `query` as a fixed-width table.
    pub fn dump_table(&self, query: &str) -> Result<String, PipelineError> {
        // Keyed by the query text itself: every distinct dump is its own
        // cached statement.
        self.statement(query, query, |stmt| {
            let mut out = String::new();

            let columns: Vec<String> =
                stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
            for name in &columns {
                let _ = write!(out, "{}{SEPARATOR}", cell(name));
            }
            out.push('\n');

            let mut rows = stmt
                .query([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Connection, &e))?;
            while let Some(row) = rows
                .next()
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Connection, &e))?
            {
                for i in 0..columns.len() {
                    let value = row
                        .get_ref(i)
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Connection, &e))?;
                    let _ = write!(out, "{}{SEPARATOR}", cell(&render(value)));
                }
                out.push('\n');
            }

            Ok(out)
        })
    }
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NaN".to_owned(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => format!("{v:.6}"),
        ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
        ValueRef::Blob(v) => format!("<{} bytes>", v.len()),
    }
}

fn cell(text: &str) -> String {
    if text.len() > CELL_WIDTH {
        let head = &text[..CELL_WIDTH / 2 - 1];
        let tail = &text[text.len() - (CELL_WIDTH / 2 - 1)..];
        format!("{head}..{tail}")
    } else {
        format!("{text:<width$}", width = CELL_WIDTH)
    }
}

///
/// TESTS
///
