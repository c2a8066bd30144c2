pub mod functions;

mod dump;
mod schema;

use crate::{
    error::{ErrorOrigin, PipelineError},
    prng::{PrngRegistry, PrngToken, SharedGenerator},
};
use rusqlite::{CachedStatement, Connection, OpenFlags};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    sync::Arc,
};
use tracing::debug;

///
/// StoreLocation
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreLocation {
    /// Private in-memory store; contents die with the connection.
    Memory,
    /// File-backed store at the given path (SQLite URI syntax allowed).
    File(String),
}

impl StoreLocation {
    fn connect(&self) -> Result<Connection, PipelineError> {
        let conn = match self {
            Self::Memory => Connection::open_in_memory(),
            Self::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            ),
        };

        conn.map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))
    }
}

/// Reject any identifier that is not alphanumeric-plus-underscore.
///
/// Mandatory guard before an identifier is spliced into generated SQL text;
/// values always go through parameter binding instead.
pub fn validate_identifier(origin: ErrorOrigin, token: &str) -> Result<(), PipelineError> {
    let valid =
        !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(PipelineError::config(
            origin,
            format!("invalid identifier token: '{token}'"),
        ))
    }
}

struct NamedStatement {
    generation: u64,
    sql: String,
}

///
/// EventStore
///
/// Owns the relational connection, the named-statement registry and the
/// binding to the PRNG registry. Components borrow the store for the
/// duration of one `execute()`; they never own it.
///
/// Prepared statements are cached per connection and come back reset and
/// ready to bind. The cache is keyed by logical name within one connection
/// generation; refreshing the connection (see
/// [`crate::maintenance::UpdateConnection`]) bumps the generation and the
/// whole cache is rebuilt lazily.
///

pub struct EventStore {
    conn: RefCell<Connection>,
    location: RefCell<StoreLocation>,
    generation: Cell<u64>,
    statements: RefCell<HashMap<String, NamedStatement>>,
    prng: Arc<PrngRegistry>,
    token: Cell<PrngToken>,
}

impl EventStore {
    /// Open (or create) the event store, install the schema and register
    /// the custom scalar SQL functions.
    ///
    /// With `seed = None` the connection has no generator bound yet; the
    /// first randomness request will fail unless the `os-seeding` feature
    /// is enabled or [`Self::seed_generator`] is called first.
    pub fn open(
        location: StoreLocation,
        prng: Arc<PrngRegistry>,
        seed: Option<u64>,
    ) -> Result<Self, PipelineError> {
        let conn = location.connect()?;
        conn.execute_batch(schema::CREATE_SCHEMA)
            .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))?;

        let token = prng.mint_token();
        if let Some(seed) = seed {
            prng.get_or_create(token, Some(seed))?;
        }

        let store = Self {
            conn: RefCell::new(conn),
            location: RefCell::new(location),
            generation: Cell::new(1),
            statements: RefCell::new(HashMap::new()),
            prng,
            token: Cell::new(token),
        };
        store.register_scalar_functions()?;

        Ok(store)
    }

    /// Run `body` with the named prepared statement, reset and ready to
    /// bind. Compiles and caches on first use; a logical name must not be
    /// rebound to different SQL within one connection generation.
    pub fn statement<T>(
        &self,
        name: &str,
        sql: &str,
        body: impl FnOnce(&mut CachedStatement<'_>) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        self.check_named(name, sql)?;

        let conn = self.conn.borrow();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))?;

        body(&mut stmt)
    }

    fn check_named(&self, name: &str, sql: &str) -> Result<(), PipelineError> {
        let generation = self.generation.get();
        let mut statements = self.statements.borrow_mut();

        match statements.get(name) {
            Some(named) if named.generation == generation => {
                if named.sql == sql {
                    Ok(())
                } else {
                    Err(PipelineError::config(
                        ErrorOrigin::Connection,
                        format!("statement name '{name}' rebound with different SQL"),
                    ))
                }
            }
            _ => {
                statements.insert(
                    name.to_owned(),
                    NamedStatement {
                        generation,
                        sql: sql.to_owned(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Bracket a batch of writes. No nested transactions; caller discipline.
    pub fn begin_transaction(&self) -> Result<(), PipelineError> {
        self.execute_batch("BEGIN")
    }

    /// Exclusive variant used by the maintenance path.
    pub fn begin_exclusive_transaction(&self) -> Result<(), PipelineError> {
        self.execute_batch("BEGIN EXCLUSIVE")
    }

    /// Close the current transaction bracket.
    pub fn end_transaction(&self) -> Result<(), PipelineError> {
        self.execute_batch("COMMIT")
    }

    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), PipelineError> {
        self.conn
            .borrow()
            .execute_batch(sql)
            .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))
    }

    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.borrow().last_insert_rowid()
    }

    /// Run a query expected to produce a single integer cell.
    pub fn scalar_i64(&self, name: &str, sql: &str) -> Result<i64, PipelineError> {
        self.statement(name, sql, |stmt| {
            stmt.query_row([], |row| row.get::<_, i64>(0))
                .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))
        })
    }

    /// The generator bound to this connection.
    pub fn generator(&self) -> Result<SharedGenerator, PipelineError> {
        self.prng.get_or_create(self.token.get(), None)
    }

    /// Seed (or reseed) the generator bound to this connection.
    pub fn seed_generator(&self, seed: u64) -> Result<SharedGenerator, PipelineError> {
        self.prng.get_or_create(self.token.get(), Some(seed))
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    #[must_use]
    pub fn location(&self) -> StoreLocation {
        self.location.borrow().clone()
    }

    /// Install every custom scalar SQL function on the live connection.
    /// Must be re-run after a connection refresh.
    pub fn register_scalar_functions(&self) -> Result<(), PipelineError> {
        functions::register_all(&self.conn.borrow(), &self.prng, self.token.get())
    }

    /// Install one caller-supplied scalar function, invocable from SQL text
    /// by `name`. Registrations live on the connection handle: re-register
    /// after a connection refresh.
    pub fn register_scalar_function<F, T>(
        &self,
        name: &str,
        n_args: i32,
        func: F,
    ) -> Result<(), PipelineError>
    where
        F: FnMut(&rusqlite::functions::Context<'_>) -> rusqlite::Result<T>
            + Send
            + std::panic::UnwindSafe
            + 'static,
        T: rusqlite::types::ToSql,
    {
        self.conn
            .borrow()
            .create_scalar_function(
                name,
                n_args,
                rusqlite::functions::FunctionFlags::SQLITE_UTF8,
                func,
            )
            .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Functions, &err))
    }

    /// Close and reopen the connection, optionally against a new target.
    ///
    /// The successor generator is seeded with `seed` and the predecessor is
    /// released; session-scoped tables and views are deliberately lost.
    pub(crate) fn reopen(
        &self,
        target: Option<StoreLocation>,
        seed: u64,
    ) -> Result<(), PipelineError> {
        let location = target.unwrap_or_else(|| self.location.borrow().clone());
        let conn = location.connect()?;
        conn.execute_batch(schema::CREATE_SCHEMA)
            .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Connection, &err))?;

        let old_token = self.token.get();
        let token = self.prng.mint_token();
        self.prng.get_or_create(token, Some(seed))?;

        *self.conn.borrow_mut() = conn;
        *self.location.borrow_mut() = location;
        self.generation.set(self.generation.get() + 1);
        self.statements.borrow_mut().clear();
        self.token.set(token);
        self.prng.release(old_token);

        self.register_scalar_functions()?;
        debug!(generation = self.generation.get(), "store connection refreshed");

        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        self.prng.release(self.token.get());
    }
}

///
/// TESTS
///
