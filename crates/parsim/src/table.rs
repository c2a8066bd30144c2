//! Materializes SELECT results into a named table with an explicit column
//! contract, replacing its contents on every run.

use crate::{
    db::{EventStore, validate_identifier},
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
};
use tracing::debug;

///
/// TemporaryTable
///
/// Session-scoped by default; `make_persistent` keeps the table across a
/// connection refresh. Multiple SELECT statements append sequentially into
/// the same table and must all produce the declared column count.
///

#[derive(Debug)]
pub struct TemporaryTable {
    output_table: String,
    columns: Vec<String>,
    select_statements: Vec<String>,
    make_persistent: bool,
}

impl TemporaryTable {
    pub fn new(
        output_table: impl Into<String>,
        columns: Vec<String>,
        select_statements: Vec<String>,
        make_persistent: bool,
    ) -> Result<Self, PipelineError> {
        let output_table = output_table.into();
        validate_identifier(ErrorOrigin::Table, &output_table)?;
        for column in &columns {
            validate_identifier(ErrorOrigin::Table, column)?;
        }

        Ok(Self {
            output_table,
            columns,
            select_statements,
            make_persistent,
        })
    }

    fn create_sql(&self) -> String {
        let scope = if self.make_persistent { "" } else { "TEMPORARY " };
        format!(
            "CREATE {scope}TABLE IF NOT EXISTS {} ({})",
            self.output_table,
            self.columns.join(", ")
        )
    }

    fn insert_sql(&self, select_statement: &str) -> String {
        format!(
            "INSERT INTO {} ({}) {select_statement}",
            self.output_table,
            self.columns.join(", ")
        )
    }
}

impl Transformer for TemporaryTable {
    fn name(&self) -> &str {
        &self.output_table
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let create_sql = self.create_sql();
        store.statement(&create_sql, &create_sql, |stmt| {
            stmt.execute([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Table, &e))?;
            Ok(())
        })?;

        let delete_sql = format!("DELETE FROM {}", self.output_table);
        store.statement(&delete_sql, &delete_sql, |stmt| {
            stmt.execute([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Table, &e))?;
            Ok(())
        })?;

        for select_statement in &self.select_statements {
            let insert_sql = self.insert_sql(select_statement);
            store.statement(&insert_sql, &insert_sql, |stmt| {
                stmt.execute([])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Table, &e))?;
                Ok(())
            })?;
        }

        debug!(table = %self.output_table, "derived table rebuilt");
        Ok(())
    }
}

///
/// TESTS
///
