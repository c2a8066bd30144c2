//! Marks the primary vertex of each collision.
//!
//! Three tiers, first success wins per collision:
//! 1. a vertex already flagged primary at load time;
//! 2. the production vertex of the signal-status particle with the lowest
//!    source id;
//! 3. the production vertex of the particle with the lowest source id
//!    overall.
//!
//! The tie-break is "lowest source particle id", evaluated in SQL, so the
//! outcome is independent of insertion order. After marking, the chosen
//! vertices are imported into `MCVertices` with coordinates offset by the
//! collision origin; if more than one vertex ended up flagged, only the
//! lowest-id import per collision survives.

use crate::{
    STATUS_SIGNAL_IN_LAB_FRAME,
    db::EventStore,
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
};
use rusqlite::params;
use tracing::{debug, warn};

/// Mark tier-N candidate vertices primary, restricted to collisions that
/// still have none. `{status_filter}` narrows the candidate particles.
macro_rules! mark_primary_sql {
    ($status_filter:literal) => {
        concat!(
            "UPDATE GenVertices SET is_primary = 1 \
             WHERE genvertex_id IN ( \
               SELECT p.production_vertex \
               FROM GenParticles AS p \
               JOIN ( \
                 SELECT genevent_id, MIN(hepmc_id) AS first_id \
                 FROM GenParticles \
                 WHERE production_vertex IS NOT NULL ",
            $status_filter,
            "    GROUP BY genevent_id \
               ) AS lowest \
                 ON p.genevent_id = lowest.genevent_id AND p.hepmc_id = lowest.first_id \
               JOIN ( \
                 SELECT genevent_id FROM GenVertices \
                 GROUP BY genevent_id HAVING SUM(is_primary) = 0 \
               ) AS no_pv ON no_pv.genevent_id = p.genevent_id \
               WHERE p.production_vertex IS NOT NULL ",
            $status_filter,
            ")"
        )
    };
}

///
/// PvFinder
///

#[derive(Clone, Copy, Debug)]
pub struct PvFinder {
    signal_status_code: i64,
}

impl PvFinder {
    #[must_use]
    pub const fn new(signal_status_code: i64) -> Self {
        Self { signal_status_code }
    }

    fn primary_count(&self, store: &EventStore) -> Result<i64, PipelineError> {
        store.scalar_i64(
            "count_primaries",
            "SELECT COALESCE(SUM(is_primary), 0) FROM GenVertices",
        )
    }
}

impl Default for PvFinder {
    fn default() -> Self {
        Self::new(STATUS_SIGNAL_IN_LAB_FRAME)
    }
}

impl Transformer for PvFinder {
    fn name(&self) -> &str {
        "pv_finder"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        store.begin_transaction()?;
        let result = self.run(store);
        store.end_transaction()?;
        result
    }
}

impl PvFinder {
    fn run(&self, store: &EventStore) -> Result<(), PipelineError> {
        debug!(primaries = self.primary_count(store)?, "imported primaries");

        // Tier 2: signal-status particles.
        store.statement(
            "mark_pv_from_signal",
            mark_primary_sql!("AND status = ?1 "),
            |stmt| {
                stmt.execute(params![self.signal_status_code])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvFinder, &e))?;
                Ok(())
            },
        )?;
        debug!(primaries = self.primary_count(store)?, "primaries after signal tier");

        // Tier 3: any particle.
        store.statement("mark_pv_from_any", mark_primary_sql!(""), |stmt| {
            stmt.execute([])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvFinder, &e))?;
            Ok(())
        })?;
        debug!(primaries = self.primary_count(store)?, "primaries after fallback tier");

        // Import the flagged vertices into the reduced tree, offset by the
        // collision origin.
        store.statement(
            "import_primary_vertices",
            "INSERT OR IGNORE INTO MCVertices \
               (genvertex_id, genevent_id, status, is_primary, t, x, y, z) \
             SELECT v.genvertex_id, v.genevent_id, v.status, 1, \
                    v.t + e.t, v.x + e.x, v.y + e.y, v.z + e.z \
             FROM GenVertices AS v \
             JOIN GenEvents AS e ON v.genevent_id = e.genevent_id \
             WHERE v.is_primary = 1",
            |stmt| {
                stmt.execute([])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvFinder, &e))?;
                Ok(())
            },
        )?;

        // More than one flagged vertex per collision: keep the lowest-id
        // import, discard the rest.
        store.statement(
            "dedup_primary_vertices",
            "DELETE FROM MCVertices \
             WHERE is_primary = 1 AND mcvertex_id NOT IN ( \
               SELECT MIN(mcvertex_id) FROM MCVertices \
               WHERE is_primary = 1 GROUP BY genevent_id)",
            |stmt| {
                stmt.execute([])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::PvFinder, &e))?;
                Ok(())
            },
        )?;

        let unresolved = store.scalar_i64(
            "count_unresolved_collisions",
            "SELECT COUNT(*) FROM ( \
               SELECT genevent_id FROM GenVertices \
               GROUP BY genevent_id HAVING SUM(is_primary) != 1)",
        )?;
        if unresolved > 0 {
            warn!(collisions = unresolved, "collisions without a unique primary vertex");
        }

        Ok(())
    }
}

///
/// TESTS
///
