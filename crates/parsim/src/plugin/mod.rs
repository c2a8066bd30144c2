//! Binds externally compiled parametrization kernels to SQL row sources.
//!
//! A plugin turns the rows of a caller-supplied SELECT into a fully
//! rebuilt output table: integer reference keys are copied through
//! untouched so the outputs can be joined back to their source rows, every
//! other column is coerced to an f32 feature and fed to the kernel in
//! select order. Identifiers are validated before they are spliced into
//! generated DDL; values are always bound, never interpolated.

mod kernel;

pub use kernel::{DeterministicFn, DeterministicKernel, GenerativeFn, GenerativeKernel};

use crate::{
    db::{EventStore, validate_identifier},
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
    prng,
};
use rand::Rng;
use rand_distr::StandardNormal;
use rusqlite::types::{Value, ValueRef};
use std::collections::HashSet;
use tracing::debug;

///
/// PluginTable
/// Column contract shared by the deterministic and generative variants.
///

#[derive(Debug)]
struct PluginTable {
    select_query: String,
    output_table: String,
    outputs: Vec<String>,
    reference_keys: Vec<String>,
}

impl PluginTable {
    fn new(
        select_query: String,
        output_table: String,
        outputs: Vec<String>,
        reference_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        validate_identifier(ErrorOrigin::Plugin, &output_table)?;
        for column in outputs.iter().chain(reference_keys.iter()) {
            validate_identifier(ErrorOrigin::Plugin, column)?;
        }

        Ok(Self {
            select_query,
            output_table,
            outputs,
            reference_keys,
        })
    }

    fn create_sql(&self) -> String {
        let mut columns: Vec<String> = self
            .reference_keys
            .iter()
            .map(|key| format!("{key} INTEGER"))
            .collect();
        columns.extend(self.outputs.iter().map(|out| format!("{out} REAL")));

        format!("CREATE TABLE {} ({})", self.output_table, columns.join(", "))
    }

    fn insert_sql(&self) -> String {
        let columns: Vec<&str> = self
            .reference_keys
            .iter()
            .chain(self.outputs.iter())
            .map(String::as_str)
            .collect();
        let placeholders: Vec<String> =
            (1..=columns.len()).map(|i| format!("?{i}")).collect();

        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.output_table,
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Rebuild the output table and run the kernel row by row.
    ///
    /// One output row per input row; a failure in row N leaves rows
    /// 1..N-1 in place (callers wrap the call in a transaction when they
    /// need atomicity).
    fn execute_rows(
        &self,
        store: &EventStore,
        mut eval: impl FnMut(&mut [f32], &[f32]) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        let drop_sql = format!("DROP TABLE IF EXISTS {}", self.output_table);
        store.statement(&drop_sql, &drop_sql, |stmt| {
            stmt.execute([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
            Ok(())
        })?;
        let create_sql = self.create_sql();
        store.statement(&create_sql, &create_sql, |stmt| {
            stmt.execute([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
            Ok(())
        })?;

        let insert_sql = self.insert_sql();
        let mut n_rows = 0_u64;

        store.statement(&self.select_query, &self.select_query, |stmt| {
            // Partition the select columns by *name*: configured reference
            // keys are copied through, everything else is a feature in
            // select order.
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
            let key_set: HashSet<&str> =
                self.reference_keys.iter().map(String::as_str).collect();

            let key_positions: Vec<usize> = self
                .reference_keys
                .iter()
                .map(|key| {
                    column_names
                        .iter()
                        .position(|name| name == key)
                        .ok_or_else(|| {
                            PipelineError::config(
                                ErrorOrigin::Plugin,
                                format!("reference key column '{key}' missing from the row source"),
                            )
                        })
                })
                .collect::<Result<_, _>>()?;
            let feature_positions: Vec<usize> = column_names
                .iter()
                .enumerate()
                .filter(|(_, name)| !key_set.contains(name.as_str()))
                .map(|(i, _)| i)
                .collect();

            let mut rows = stmt
                .query([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
            while let Some(row) = rows
                .next()
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?
            {
                let mut values: Vec<Value> =
                    Vec::with_capacity(self.reference_keys.len() + self.outputs.len());
                for &position in &key_positions {
                    let key: Option<i64> = row
                        .get(position)
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
                    values.push(key.map_or(Value::Null, Value::Integer));
                }

                let mut features = Vec::with_capacity(feature_positions.len());
                for &position in &feature_positions {
                    let value = row
                        .get_ref(position)
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
                    features.push(read_as_float(value));
                }

                let mut output = vec![0.0_f32; self.outputs.len()];
                eval(&mut output, &features)?;
                values.extend(output.iter().map(|v| Value::Real(f64::from(*v))));

                store.statement(&insert_sql, &insert_sql, |insert| {
                    insert
                        .execute(rusqlite::params_from_iter(values.iter()))
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Plugin, &e))?;
                    Ok(())
                })?;
                n_rows += 1;
            }

            Ok(())
        })?;

        debug!(table = %self.output_table, rows = n_rows, "plugin output table rebuilt");
        Ok(())
    }
}

/// Feature coercion: integers and floats narrow to f32, anything else
/// (NULL, text, blobs) becomes NaN.
fn read_as_float(value: ValueRef<'_>) -> f32 {
    match value {
        ValueRef::Integer(v) => v as f32,
        ValueRef::Real(v) => v as f32,
        ValueRef::Null | ValueRef::Text(_) | ValueRef::Blob(_) => f32::NAN,
    }
}

///
/// Plugin
/// Deterministic variant: features in, outputs out.
///

#[derive(Debug)]
pub struct Plugin {
    kernel: DeterministicKernel,
    table: PluginTable,
}

impl Plugin {
    /// Bind an already-resolved kernel to a row source and output table.
    pub fn new(
        kernel: DeterministicKernel,
        select_query: impl Into<String>,
        output_table: impl Into<String>,
        outputs: Vec<String>,
        reference_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            kernel,
            table: PluginTable::new(
                select_query.into(),
                output_table.into(),
                outputs,
                reference_keys,
            )?,
        })
    }

    /// Resolve the kernel from a shared module, then bind it.
    pub fn open(
        library_path: &str,
        symbol: &str,
        select_query: impl Into<String>,
        output_table: impl Into<String>,
        outputs: Vec<String>,
        reference_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        Self::new(
            DeterministicKernel::load(library_path, symbol)?,
            select_query,
            output_table,
            outputs,
            reference_keys,
        )
    }
}

impl Transformer for Plugin {
    fn name(&self) -> &str {
        &self.table.output_table
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let kernel = &self.kernel;
        self.table.execute_rows(store, |output, input| {
            kernel.eval(output, input);
            Ok(())
        })
    }
}

///
/// GenerativePlugin
/// Adds `n_random` standard-normal draws from the connection's generator
/// to every kernel call.
///

pub struct GenerativePlugin {
    kernel: GenerativeKernel,
    n_random: usize,
    table: PluginTable,
}

impl GenerativePlugin {
    /// Bind an already-resolved kernel to a row source and output table.
    pub fn new(
        kernel: GenerativeKernel,
        n_random: usize,
        select_query: impl Into<String>,
        output_table: impl Into<String>,
        outputs: Vec<String>,
        reference_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            kernel,
            n_random,
            table: PluginTable::new(
                select_query.into(),
                output_table.into(),
                outputs,
                reference_keys,
            )?,
        })
    }

    /// Resolve the kernel from a shared module, then bind it.
    pub fn open(
        library_path: &str,
        symbol: &str,
        n_random: usize,
        select_query: impl Into<String>,
        output_table: impl Into<String>,
        outputs: Vec<String>,
        reference_keys: Vec<String>,
    ) -> Result<Self, PipelineError> {
        Self::new(
            GenerativeKernel::load(library_path, symbol)?,
            n_random,
            select_query,
            output_table,
            outputs,
            reference_keys,
        )
    }
}

impl Transformer for GenerativePlugin {
    fn name(&self) -> &str {
        &self.table.output_table
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let generator = store.generator()?;
        let kernel = &self.kernel;
        let n_random = self.n_random;

        self.table.execute_rows(store, |output, input| {
            // Locked per row: the row source itself may call the
            // PRNG-backed SQL functions on the same generator.
            let mut rng = prng::lock(&generator);
            let random: Vec<f32> =
                (0..n_random).map(|_| rng.sample(StandardNormal)).collect();
            drop(rng);

            kernel.eval(output, input, &random);
            Ok(())
        })
    }
}

///
/// TESTS
///
