//! Emulates primary-vertex reconstruction.
//!
//! The difference between true and reconstructed PV positions is modelled
//! per axis as a three-Gaussian mixture with shared mean: weights f1, f2,
//! (1 - f1 - f2) and per-component widths. The model deliberately ignores
//! the track multiplicity dependence and axis correlations.

use crate::{
    VERTEX_TYPE_PRIMARY,
    db::{self, EventStore, functions::categorical_index},
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
    prng,
};
use rand::Rng;
use rand_distr::StandardNormal;
use rand_chacha::ChaCha8Rng;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

///
/// AxisSmearing
/// Parameters of a one-dimensional three-Gaussian resolution function.
///

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AxisSmearing {
    pub mu: f64,
    pub f1: f64,
    pub f2: f64,
    pub sigma1: f64,
    pub sigma2: f64,
    pub sigma3: f64,
}

impl AxisSmearing {
    /// Conservative per-axis uncertainty estimate: the widest of the three
    /// components, not the mixture variance.
    #[must_use]
    pub fn sigma_estimate(&self) -> f64 {
        self.sigma1.max(self.sigma2).max(self.sigma3)
    }

    fn sample(&self, rng: &mut ChaCha8Rng, true_value: f64) -> f64 {
        let r: f64 = rng.random();
        let sigma = match categorical_index(r, &[self.f1, self.f2]) {
            0 => self.sigma1,
            1 => self.sigma2,
            _ => self.sigma3,
        };
        let unit: f64 = rng.sample(StandardNormal);

        true_value + self.mu + unit * sigma
    }
}

///
/// SmearingParametrization
/// Per-axis resolution functions for x, y and z.
///

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SmearingParametrization {
    pub x: AxisSmearing,
    pub y: AxisSmearing,
    pub z: AxisSmearing,
}

impl SmearingParametrization {
    /// Read the parametrization for a data-taking `condition` from an
    /// auxiliary store: one row per axis, matched case-insensitively on
    /// `(condition, coord)`.
    pub fn load(
        file_path: &str,
        table_name: &str,
        condition: &str,
    ) -> Result<Self, PipelineError> {
        db::validate_identifier(ErrorOrigin::PvReconstruction, table_name)?;
        info!(path = file_path, condition, "loading PV smearing parametrization");

        let conn = Connection::open_with_flags(
            file_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|err| {
            PipelineError::config(
                ErrorOrigin::PvReconstruction,
                format!("cannot open parametrization store '{file_path}': {err}"),
            )
        })?;

        let sql = format!(
            "SELECT mu, f1, f2, sigma1, sigma2, sigma3 FROM {table_name} \
             WHERE condition = ?1 COLLATE NOCASE AND coord = ?2 COLLATE NOCASE"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &e))?;

        let mut axis = |coord: &str| -> Result<AxisSmearing, PipelineError> {
            stmt.query_row(params![condition, coord], |row| {
                Ok(AxisSmearing {
                    mu: row.get(0)?,
                    f1: row.get(1)?,
                    f2: row.get(2)?,
                    sigma1: row.get(3)?,
                    sigma2: row.get(4)?,
                    sigma3: row.get(5)?,
                })
            })
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => PipelineError::config(
                    ErrorOrigin::PvReconstruction,
                    format!("no parametrization for condition '{condition}', coordinate '{coord}'"),
                ),
                other => PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &other),
            })
        };

        Ok(Self {
            x: axis("x")?,
            y: axis("y")?,
            z: axis("z")?,
        })
    }
}

///
/// PvReconstruction
///

#[derive(Clone, Copy, Debug)]
pub struct PvReconstruction {
    parametrization: SmearingParametrization,
}

impl PvReconstruction {
    #[must_use]
    pub const fn new(parametrization: SmearingParametrization) -> Self {
        Self { parametrization }
    }
}

impl Transformer for PvReconstruction {
    fn name(&self) -> &str {
        "pv_reconstruction"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        let generator = store.generator()?;

        let primaries: Vec<(i64, i64, f64, f64, f64)> = store.statement(
            "select_primary_mcvertices",
            "SELECT mcvertex_id, genevent_id, x, y, z FROM MCVertices \
             WHERE is_primary = 1 ORDER BY mcvertex_id",
            |stmt| {
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                        ))
                    })
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &e))
            },
        )?;

        store.begin_transaction()?;
        let result = self.smear_all(store, &generator, &primaries);
        store.end_transaction()?;
        result?;

        debug!(vertices = primaries.len(), "reconstructed primary vertices");
        Ok(())
    }
}

impl PvReconstruction {
    fn smear_all(
        &self,
        store: &EventStore,
        generator: &prng::SharedGenerator,
        primaries: &[(i64, i64, f64, f64, f64)],
    ) -> Result<(), PipelineError> {
        let pars = &self.parametrization;
        let mut rng = prng::lock(generator);

        for &(mcvertex_id, genevent_id, x, y, z) in primaries {
            let sx = pars.x.sample(&mut rng, x);
            let sy = pars.y.sample(&mut rng, y);
            let sz = pars.z.sample(&mut rng, z);

            store.statement(
                "insert_reconstructed_pv",
                "INSERT INTO Vertices \
                   (mcvertex_id, genevent_id, vertex_type, x, y, z, \
                    sigma_x, sigma_y, sigma_z) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                |stmt| {
                    stmt.execute(params![
                        mcvertex_id,
                        genevent_id,
                        VERTEX_TYPE_PRIMARY,
                        sx,
                        sy,
                        sz,
                        pars.x.sigma_estimate(),
                        pars.y.sigma_estimate(),
                        pars.z.sigma_estimate(),
                    ])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &e))?;
                    Ok(())
                },
            )?;
        }

        Ok(())
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::StoreLocation,
        prng::PrngRegistry,
    };
    use std::sync::Arc;

    fn store_with_primary_mcvertex(seed: u64) -> EventStore {
        let store =
            EventStore::open(StoreLocation::Memory, Arc::new(PrngRegistry::new()), Some(seed))
                .expect("open store");
        store
            .execute_batch(
                "INSERT INTO GenEvents (datasource_id, collision, t, x, y, z) \
                 VALUES (1, 0, 0.0, 0.0, 0.0, 0.0); \
                 INSERT INTO MCVertices \
                   (genvertex_id, genevent_id, status, is_primary, t, x, y, z) \
                 VALUES (1, 1, 0, 1, 0.0, 1.0, 2.0, 3.0);",
            )
            .expect("seed mcvertex");
        store
    }

    fn offset_only(mu: f64) -> SmearingParametrization {
        let axis = AxisSmearing {
            mu,
            f1: 0.5,
            f2: 0.3,
            sigma1: 0.0,
            sigma2: 0.0,
            sigma3: 0.0,
        };
        SmearingParametrization {
            x: axis,
            y: axis,
            z: axis,
        }
    }

    fn reconstructed_row(store: &EventStore) -> (f64, f64, f64, f64) {
        store
            .statement(
                "read_vertex",
                "SELECT x, y, z, sigma_z FROM Vertices",
                |stmt| {
                    stmt.query_row([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvReconstruction, &e))
                },
            )
            .expect("one reconstructed vertex")
    }

    #[test]
    fn zero_width_mixture_reduces_to_a_shift() {
        let store = store_with_primary_mcvertex(11);
        PvReconstruction::new(offset_only(0.25))
            .execute(&store)
            .expect("reconstruct");

        let (x, y, z, sigma_z) = reconstructed_row(&store);
        assert!((x - 1.25).abs() < 1e-12);
        assert!((y - 2.25).abs() < 1e-12);
        assert!((z - 3.25).abs() < 1e-12);
        assert!(sigma_z.abs() < 1e-12);
    }

    #[test]
    fn sigma_estimate_is_the_widest_component() {
        let axis = AxisSmearing {
            mu: 0.0,
            f1: 0.2,
            f2: 0.3,
            sigma1: 1.0,
            sigma2: 5.0,
            sigma3: 2.0,
        };
        assert!((axis.sigma_estimate() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn identical_seeds_reconstruct_identical_vertices() {
        let pars = SmearingParametrization {
            x: AxisSmearing {
                mu: 0.0,
                f1: 0.6,
                f2: 0.3,
                sigma1: 0.1,
                sigma2: 0.5,
                sigma3: 2.0,
            },
            y: AxisSmearing {
                mu: -0.1,
                f1: 0.2,
                f2: 0.2,
                sigma1: 0.2,
                sigma2: 0.4,
                sigma3: 0.8,
            },
            z: AxisSmearing {
                mu: 0.3,
                f1: 0.9,
                f2: 0.05,
                sigma1: 0.05,
                sigma2: 0.3,
                sigma3: 1.0,
            },
        };

        let a = store_with_primary_mcvertex(77);
        let b = store_with_primary_mcvertex(77);
        PvReconstruction::new(pars).execute(&a).expect("a");
        PvReconstruction::new(pars).execute(&b).expect("b");

        assert_eq!(reconstructed_row(&a), reconstructed_row(&b));
    }

    #[test]
    fn load_parametrization_reports_missing_conditions() {
        let path = std::env::temp_dir().join(format!(
            "parsim_pv_pars_{}.db",
            std::process::id()
        ));
        let path_str = path.to_string_lossy().into_owned();

        {
            let conn = Connection::open(&path).expect("create aux store");
            conn.execute_batch(
                "CREATE TABLE pv_smearing ( \
                   condition TEXT, coord TEXT, \
                   mu REAL, f1 REAL, f2 REAL, \
                   sigma1 REAL, sigma2 REAL, sigma3 REAL); \
                 INSERT INTO pv_smearing VALUES \
                   ('2016 MagUp', 'x', 0.0, 0.5, 0.3, 0.01, 0.05, 0.1), \
                   ('2016 MagUp', 'y', 0.0, 0.5, 0.3, 0.01, 0.05, 0.1), \
                   ('2016 MagUp', 'z', 0.1, 0.6, 0.3, 0.05, 0.20, 0.4);",
            )
            .expect("fill aux store");
        }

        // Case-insensitive condition match.
        let pars = SmearingParametrization::load(&path_str, "pv_smearing", "2016 magup")
            .expect("load parametrization");
        assert!((pars.z.mu - 0.1).abs() < 1e-12);
        assert!((pars.z.sigma_estimate() - 0.4).abs() < 1e-12);

        let missing = SmearingParametrization::load(&path_str, "pv_smearing", "2018 MagDown")
            .expect_err("unknown condition must fail");
        assert!(missing.is_configuration());

        let bad_table = SmearingParametrization::load(&path_str, "pv; DROP", "2016 MagUp")
            .expect_err("invalid table token must fail");
        assert!(bad_table.is_configuration());

        let _ = std::fs::remove_file(&path);
    }
}
