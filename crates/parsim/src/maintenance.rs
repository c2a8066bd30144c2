//! Store maintenance stages: bulk row clearing, ad hoc statement batches,
//! and connection refresh.

use crate::{
    db::{EventStore, StoreLocation, validate_identifier},
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
    prng,
};
use rand::Rng;
use tracing::{debug, info};

///
/// CleanEventStore
///
/// Deletes every row from every ordinary and session-scoped table so the
/// store can be reused for the next batch. The schema itself is untouched.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanEventStore;

impl CleanEventStore {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn list_tables(store: &EventStore, name: &str, sql: &str) -> Result<Vec<String>, PipelineError> {
        store.statement(name, sql, |stmt| {
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Maintenance, &e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Maintenance, &e))
        })
    }
}

impl Transformer for CleanEventStore {
    fn name(&self) -> &str {
        "clean_event_store"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let mut tables = Self::list_tables(
            store,
            "list_tables",
            "SELECT name FROM main.sqlite_schema WHERE type = 'table'",
        )?;
        tables.extend(Self::list_tables(
            store,
            "list_temp_tables",
            "SELECT name FROM temp.sqlite_schema WHERE type = 'table'",
        )?);

        store.begin_transaction()?;
        let mut clear = || -> Result<(), PipelineError> {
            for table in &tables {
                validate_identifier(ErrorOrigin::Maintenance, table)?;
                let delete_sql = format!("DELETE FROM {table}");
                store.statement(&delete_sql, &delete_sql, |stmt| {
                    stmt.execute([])
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Maintenance, &e))?;
                    Ok(())
                })?;
            }
            Ok(())
        };
        let result = clear();
        store.end_transaction()?;
        result?;

        debug!(tables = tables.len(), "event store cleared");
        Ok(())
    }
}

///
/// EditEventStore
///
/// Runs an arbitrary list of statements inside one exclusive transaction,
/// discarding any result rows. Used for ad hoc schema or data patches
/// between pipeline stages.
///

pub struct EditEventStore {
    queries: Vec<String>,
}

impl EditEventStore {
    #[must_use]
    pub const fn new(queries: Vec<String>) -> Self {
        Self { queries }
    }
}

impl Transformer for EditEventStore {
    fn name(&self) -> &str {
        "edit_event_store"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        store.begin_exclusive_transaction()?;
        for (index, query) in self.queries.iter().enumerate() {
            let name = format!("edit_event_store_{index:02}");
            store.statement(&name, query, |stmt| {
                let mut rows = stmt
                    .query([])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Maintenance, &e))?;
                while rows
                    .next()
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Maintenance, &e))?
                    .is_some()
                {}
                Ok(())
            })?;
        }
        store.end_transaction()
    }
}

///
/// UpdateConnection
///
/// Closes and reopens the store connection, optionally against a new
/// target. The successor generator is seeded from one draw of the
/// predecessor, preserving the deterministic lineage; custom scalar
/// functions are re-registered. Session-scoped tables and views do not
/// survive this stage by design.
///

pub struct UpdateConnection {
    target: Option<StoreLocation>,
}

impl UpdateConnection {
    /// Reopen against the current location.
    #[must_use]
    pub const fn new() -> Self {
        Self { target: None }
    }

    /// Reopen against `target` instead.
    #[must_use]
    pub const fn with_target(target: StoreLocation) -> Self {
        Self {
            target: Some(target),
        }
    }
}

impl Default for UpdateConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for UpdateConnection {
    fn name(&self) -> &str {
        "update_db_connection"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let seed = {
            let generator = store.generator()?;
            let mut rng = prng::lock(&generator);
            rng.random::<u64>()
        };

        store.reopen(self.target.clone(), seed)?;
        info!("store connection reopened");
        Ok(())
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::PrngRegistry;
    use std::sync::Arc;

    fn populated_store() -> EventStore {
        let store =
            EventStore::open(StoreLocation::Memory, Arc::new(PrngRegistry::new()), Some(1))
                .expect("open store");
        store
            .execute_batch(
                "INSERT INTO DataSources (datasource, run_number, evt_number) \
                 VALUES ('a.mc2', 1, 1); \
                 CREATE TEMPORARY TABLE scratch (x); \
                 INSERT INTO scratch VALUES (42);",
            )
            .expect("seed rows");
        store
    }

    #[test]
    fn clean_clears_rows_but_keeps_the_schema() {
        let store = populated_store();
        CleanEventStore::new().execute(&store).expect("clean");

        let rows = store
            .scalar_i64("rows_left", "SELECT COUNT(*) FROM DataSources")
            .expect("count rows");
        assert_eq!(rows, 0);

        let scratch = store
            .scalar_i64("scratch_left", "SELECT COUNT(*) FROM scratch")
            .expect("count scratch");
        assert_eq!(scratch, 0, "session-scoped tables are cleared too");

        let tables = store
            .scalar_i64(
                "tables_left",
                "SELECT COUNT(*) FROM main.sqlite_schema \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .expect("count tables");
        assert_eq!(tables, 7, "schema survives the wipe");
    }

    #[test]
    fn edit_applies_statement_batches() {
        let store = populated_store();
        EditEventStore::new(vec![
            "ALTER TABLE DataSources ADD COLUMN note TEXT".into(),
            "UPDATE DataSources SET note = 'patched'".into(),
        ])
        .execute(&store)
        .expect("edit");

        let patched = store
            .scalar_i64(
                "patched",
                "SELECT COUNT(*) FROM DataSources WHERE note = 'patched'",
            )
            .expect("count patched");
        assert_eq!(patched, 1);
    }

    #[test]
    fn edit_propagates_engine_failures() {
        let store = populated_store();
        let err = EditEventStore::new(vec!["UPDATE NoSuchTable SET x = 1".into()])
            .execute(&store)
            .expect_err("must fail");
        assert!(err.is_store());
    }

    #[test]
    fn refresh_invalidates_the_statement_cache() {
        let store = populated_store();
        store
            .statement("probe", "SELECT 1", |_| Ok(()))
            .expect("bind probe");

        UpdateConnection::new().execute(&store).expect("refresh");
        assert_eq!(store.generation(), 2);

        // Same logical name, different SQL: legal again after the cache
        // died with the old connection handle.
        store
            .statement("probe", "SELECT 2", |_| Ok(()))
            .expect("rebinding after refresh");
    }

    #[test]
    fn refresh_preserves_the_deterministic_prng_lineage() {
        let draw = |store: &EventStore| -> f64 {
            let generator = store.generator().expect("generator");
            let mut rng = prng::lock(&generator);
            rng.random::<f64>()
        };

        let a = populated_store();
        let b = populated_store();

        UpdateConnection::new().execute(&a).expect("refresh a");
        UpdateConnection::new().execute(&b).expect("refresh b");

        assert!((draw(&a) - draw(&b)).abs() < f64::EPSILON, "same lineage, same draws");
    }

    #[test]
    fn refresh_drops_session_scoped_tables() {
        let store = populated_store();
        UpdateConnection::new().execute(&store).expect("refresh");

        let scratch = store.scalar_i64("scratch_left", "SELECT COUNT(*) FROM scratch");
        assert!(scratch.is_err(), "temporary tables die with the connection");
    }
}
