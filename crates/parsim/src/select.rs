//! Reduces the generator particle graph to the experimentally meaningful
//! decay tree.
//!
//! Most generator particles describe parton-level interactions that no
//! detector can resolve. Starting from the particles produced at each
//! primary vertex, the selector walks the graph recursively, promotes the
//! retained particles to `MCParticles`, and collapses the discarded ones:
//! a dropped particle hands its own production vertex down to its
//! daughters, so the surviving structure stays a connected tree with no
//! new branch points.

use crate::{
    STATUS_DECAYED_AND_PRODUCED, STATUS_DECAYED_BY_DECAYGEN, STATUS_SIGNAL_IN_LAB_FRAME,
    STATUS_STABLE_IN_DECAYGEN, STATUS_STABLE_IN_PRODGEN,
    db::EventStore,
    error::{ErrorOrigin, PipelineError},
    pipeline::Transformer,
};
use rusqlite::{OptionalExtension, params};
use std::collections::HashSet;
use tracing::debug;

/// Everything at or below this absolute PID is a quark and never retained.
const QUARK_ABSPID_MAX: i64 = 8;

/// Lepton PID range kept by the structural fallback rule.
const LEPTON_ABSPID_RANGE: std::ops::RangeInclusive<i64> = 11..=18;

/// Default retained generator status codes.
pub const DEFAULT_RETAINED_STATUS: &[i64] = &[
    STATUS_STABLE_IN_PRODGEN,
    STATUS_DECAYED_BY_DECAYGEN,
    STATUS_DECAYED_AND_PRODUCED,
    STATUS_SIGNAL_IN_LAB_FRAME,
    STATUS_STABLE_IN_DECAYGEN,
];

/// Default retained absolute PID values.
pub const DEFAULT_RETAINED_ABSPID: &[i64] = &[
    // Standard model particles
    6, 22, 23, 24, 25, 32, 33, 34, 35, 36, 37, 102,
    // Strange mesons
    130, 310, 311, 321,
    // Charm mesons
    411, 421, 413, 423, 415, 425, 431, 435,
    // Beauty mesons
    511, 521, 513, 523, 515, 525, 531, 535, 541, 545,
    // Charmonium states
    441, 10441, 100441, 443, 10443, 20443, 100443, 30443, 9000443, 9010443,
    9020443, 445, 10445,
    // Bottomonium states
    551, 10551, 100551, 110551, 200551, 210551, 553, 10553, 20553, 30553,
    100553, 110553, 120553, 130553, 200553, 210553, 220553, 300553,
    9000553, 9010553, 555, 10555, 20555, 100555, 110555, 120555, 200555,
    557, 100557,
    // Light baryons
    2212,
    // Strange baryons
    3122, 3222, 3212, 3224, 3214, 3114, 3322, 3312, 3324, 3314, 3334,
    // Charm baryons
    4122, 4222, 4212, 4112, 4224, 4214, 4114, 4232, 4132, 4322, 4312, 4324,
    4314, 4332, 4334, 4412, 4422, 4414, 4424, 4432, 4434, 4444,
    // Beauty baryons
    5122, 5112, 5212, 5222, 5114, 5214, 5224, 5132, 5232, 5312, 5322,
    5314, 5324, 5332, 5334, 5142, 5242, 5412, 5422, 5414, 5424, 5342, 5432,
    5442, 5444, 5512, 5522, 5514, 5524, 5532, 5534, 5542, 5544, 5554,
];

///
/// ParticleSelector
///

pub struct ParticleSelector {
    retained_status: HashSet<i64>,
    retained_abspid: HashSet<i64>,
}

impl ParticleSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_allow_lists(
            DEFAULT_RETAINED_STATUS.iter().copied(),
            DEFAULT_RETAINED_ABSPID.iter().copied(),
        )
    }

    #[must_use]
    pub fn with_allow_lists(
        retained_status: impl IntoIterator<Item = i64>,
        retained_abspid: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            retained_status: retained_status.into_iter().collect(),
            retained_abspid: retained_abspid.into_iter().collect(),
        }
    }

    /// Promotion criterion. Quarks are never retained; otherwise the status
    /// and abspid allow-lists are consulted, then the lepton fallback.
    #[must_use]
    pub fn keep(&self, status: i64, abspid: i64) -> bool {
        if abspid <= QUARK_ABSPID_MAX {
            return false;
        }
        if self.retained_status.contains(&status) {
            return true;
        }
        if self.retained_abspid.contains(&abspid) {
            return true;
        }

        LEPTON_ABSPID_RANGE.contains(&abspid)
    }

    /// Recursive collapse of one particle and its descendants.
    ///
    /// `parent_vertex` is the reduced-tree vertex the particle hangs from.
    /// A kept particle with a valid end vertex materializes that vertex and
    /// hands it to its daughters; otherwise the daughters inherit
    /// `parent_vertex`, which is what removes the particle from the tree
    /// without disconnecting anything below it.
    fn process_particle(
        &self,
        store: &EventStore,
        visited: &mut HashSet<i64>,
        genparticle_id: i64,
        parent_vertex: i64,
    ) -> Result<(), PipelineError> {
        if !visited.insert(genparticle_id) {
            // Already expanded through another mother; expanding again
            // would duplicate the subtree (or never terminate on cyclic
            // input).
            debug!(particle = genparticle_id, "skipping already-expanded particle");
            return Ok(());
        }

        let info = store.statement(
            "select_particle",
            "SELECT status, pid, \
                    production_vertex IS NOT NULL, end_vertex IS NOT NULL \
             FROM GenParticles WHERE genparticle_id = ?1",
            |stmt| {
                stmt.query_row(params![genparticle_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                })
                .optional()
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))
            },
        )?;

        let Some((status, pid, has_production, has_end)) = info else {
            return Err(PipelineError::invariant(
                ErrorOrigin::Selector,
                format!("selection reached particle {genparticle_id} with no backing row"),
            ));
        };

        let kept = self.keep(status, pid.abs());
        let end_vertex = if kept && has_end {
            self.materialize_end_vertex(store, genparticle_id)?
        } else {
            parent_vertex
        };

        let daughters: Vec<i64> = if has_end {
            store.statement(
                "select_daughters",
                "SELECT daughter.genparticle_id \
                 FROM GenParticles AS mother \
                 JOIN GenParticles AS daughter \
                   ON mother.end_vertex = daughter.production_vertex \
                 WHERE mother.genparticle_id = ?1 \
                 ORDER BY daughter.genparticle_id",
                |stmt| {
                    let rows = stmt
                        .query_map(params![genparticle_id], |row| row.get::<_, i64>(0))
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))?;
                    rows.collect::<Result<Vec<_>, _>>()
                        .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))
                },
            )?
        } else {
            Vec::new()
        };

        for daughter in daughters {
            self.process_particle(store, visited, daughter, end_vertex)?;
        }

        if kept && has_production {
            self.promote(store, genparticle_id, parent_vertex, has_end.then_some(end_vertex))?;
        }

        Ok(())
    }

    /// Create (idempotently) the reduced-tree vertex backing a particle's
    /// end vertex and return its id.
    fn materialize_end_vertex(
        &self,
        store: &EventStore,
        genparticle_id: i64,
    ) -> Result<i64, PipelineError> {
        store.statement(
            "insert_end_vertex",
            "INSERT OR IGNORE INTO MCVertices \
               (genvertex_id, genevent_id, status, is_primary, t, x, y, z) \
             SELECT gv.genvertex_id, gv.genevent_id, gv.status, gv.is_primary, \
                    gv.t, gv.x, gv.y, gv.z \
             FROM GenParticles AS gp \
             JOIN GenVertices AS gv ON gp.end_vertex = gv.genvertex_id \
             WHERE gp.genparticle_id = ?1 AND gv.is_primary = 0",
            |stmt| {
                stmt.execute(params![genparticle_id])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))?;
                Ok(())
            },
        )?;

        let vertex = store.statement(
            "select_end_vertex",
            "SELECT mcv.mcvertex_id \
             FROM GenParticles AS gp \
             JOIN GenVertices AS gv ON gp.end_vertex = gv.genvertex_id \
             JOIN MCVertices AS mcv ON gv.genvertex_id = mcv.genvertex_id \
             WHERE gp.genparticle_id = ?1",
            |stmt| {
                stmt.query_row(params![genparticle_id], |row| row.get::<_, i64>(0))
                    .optional()
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))
            },
        )?;

        vertex.ok_or_else(|| {
            PipelineError::invariant(
                ErrorOrigin::Selector,
                format!("failed to materialize the end vertex of particle {genparticle_id}"),
            )
        })
    }

    fn promote(
        &self,
        store: &EventStore,
        genparticle_id: i64,
        production_vertex: i64,
        end_vertex: Option<i64>,
    ) -> Result<(), PipelineError> {
        store.statement(
            "insert_mc_particle",
            "INSERT INTO MCParticles \
               (genparticle_id, genevent_id, pid, pe, px, py, pz, m, is_signal) \
             SELECT genparticle_id, genevent_id, pid, pe, px, py, pz, m, status = ?2 \
             FROM GenParticles WHERE genparticle_id = ?1",
            |stmt| {
                stmt.execute(params![genparticle_id, STATUS_SIGNAL_IN_LAB_FRAME])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))?;
                Ok(())
            },
        )?;
        let mcparticle_id = store.last_insert_rowid();

        store.statement(
            "set_mc_particle_vertices",
            "UPDATE MCParticles \
             SET production_vertex = ?1, end_vertex = ?2 \
             WHERE mcparticle_id = ?3",
            |stmt| {
                stmt.execute(params![production_vertex, end_vertex, mcparticle_id])
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))?;
                Ok(())
            },
        )?;

        Ok(())
    }
}

impl Default for ParticleSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for ParticleSelector {
    fn name(&self) -> &str {
        "particle_selector"
    }

    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError> {
        // Particles produced at a primary vertex seed the walk; their
        // reduced-tree parent is the collision's primary MCVertex.
        let roots: Vec<(i64, i64)> = store.statement(
            "select_tree_roots",
            "SELECT p.genparticle_id, mcv.mcvertex_id \
             FROM GenParticles AS p \
             JOIN GenVertices AS v ON v.genvertex_id = p.production_vertex \
             JOIN MCVertices AS mcv ON p.genevent_id = mcv.genevent_id \
             WHERE v.is_primary = 1 AND mcv.is_primary = 1 \
             ORDER BY p.genparticle_id",
            |stmt| {
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Selector, &e))
            },
        )?;

        store.begin_transaction()?;
        let mut visited = HashSet::new();
        let mut walk = || -> Result<(), PipelineError> {
            for (genparticle_id, primary_vertex) in &roots {
                self.process_particle(store, &mut visited, *genparticle_id, *primary_vertex)?;
            }
            Ok(())
        };
        let result = walk();
        store.end_transaction()?;
        result?;

        debug!(roots = roots.len(), expanded = visited.len(), "particle selection finished");
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
        load::GraphLoader,
        prng::PrngRegistry,
        pv::PvFinder,
        source::{CollisionGraph, GraphParticle, GraphVertex, VecEventSource},
    };
    use proptest::prelude::*;
    use std::sync::Arc;

    fn memory_store() -> EventStore {
        EventStore::open(StoreLocation::Memory, Arc::new(PrngRegistry::new()), Some(1))
            .expect("open store")
    }

    fn vertex(id: i64) -> GraphVertex {
        GraphVertex {
            id,
            ..GraphVertex::default()
        }
    }

    fn particle(
        id: i64,
        pid: i64,
        status: i64,
        production_vertex: Option<i64>,
        end_vertex: Option<i64>,
    ) -> GraphParticle {
        GraphParticle {
            id,
            pid,
            status,
            production_vertex,
            end_vertex,
            pe: 10.0,
            px: 1.0,
            py: 0.0,
            pz: 3.0,
            generated_mass: 0.5,
        }
    }

    fn run_selection(store: &EventStore, collisions: Vec<CollisionGraph>) {
        let mut source = VecEventSource::new(collisions);
        GraphLoader::new()
            .load(store, &mut source, "select.mc2", 1, 1)
            .expect("load");
        PvFinder::default().execute(store).expect("pv finder");
        ParticleSelector::new().execute(store).expect("selector");
    }

    #[test]
    fn keep_checks_quark_veto_before_the_allow_lists() {
        let selector = ParticleSelector::new();

        // Signal status retained; the kaon is also independently listed.
        assert!(selector.keep(889, 321));
        // Quark veto wins even though status 1 is allow-listed.
        assert!(!selector.keep(1, 3));
        // Status allow-list alone suffices for an unlisted hadron.
        assert!(selector.keep(1, 99_999));
        // Lepton fallback when neither list matches.
        assert!(selector.keep(55, 13));
        // Nothing matches.
        assert!(!selector.keep(55, 9_999));
    }

    proptest! {
        #[test]
        fn quarks_are_never_kept(status in any::<i64>(), abspid in 0_i64..=8) {
            prop_assert!(!ParticleSelector::new().keep(status, abspid));
        }

        #[test]
        fn categorical_status_listing_keeps_non_quarks(abspid in 9_i64..100_000) {
            prop_assert!(ParticleSelector::new().keep(889, abspid));
        }
    }

    #[test]
    fn dropped_intermediate_reattaches_daughters_to_the_grandparent_vertex() {
        let store = memory_store();
        // A(kept) decays at -2; B(quark, dropped) decays at -3; C(kept,
        // stable) is B's daughter. C must attach to A's end vertex.
        run_selection(
            &store,
            vec![CollisionGraph {
                index: 0,
                vertices: vec![vertex(-1), vertex(-2), vertex(-3)],
                particles: vec![
                    particle(1, 511, 777, Some(-1), Some(-2)),
                    particle(2, 3, 2, Some(-2), Some(-3)),
                    particle(3, 211, 999, Some(-3), None),
                ],
                ..CollisionGraph::default()
            }],
        );

        let n = store
            .scalar_i64("n_mcp", "SELECT COUNT(*) FROM MCParticles")
            .expect("count");
        assert_eq!(n, 2, "quark is not promoted");

        let reattached = store
            .scalar_i64(
                "reattached",
                "SELECT COUNT(*) FROM MCParticles AS mother \
                 JOIN MCParticles AS daughter \
                   ON daughter.production_vertex = mother.end_vertex \
                 WHERE mother.pid = 511 AND daughter.pid = 211",
            )
            .expect("join count");
        assert_eq!(reattached, 1, "daughter hangs from the grandparent's end vertex");
    }

    #[test]
    fn emitted_structure_is_a_tree() {
        let store = memory_store();
        // One kept decay chain with a two-body vertex.
        run_selection(
            &store,
            vec![CollisionGraph {
                index: 0,
                vertices: vec![vertex(-1), vertex(-2)],
                particles: vec![
                    particle(1, 421, 888, Some(-1), Some(-2)),
                    particle(2, 321, 999, Some(-2), None),
                    particle(3, 211, 999, Some(-2), None),
                ],
                ..CollisionGraph::default()
            }],
        );

        // No reduced vertex may have more than one retained in-particle.
        let merges = store
            .scalar_i64(
                "vertex_merges",
                "SELECT COUNT(*) FROM ( \
                   SELECT end_vertex FROM MCParticles \
                   WHERE end_vertex IS NOT NULL \
                   GROUP BY end_vertex HAVING COUNT(*) > 1)",
            )
            .expect("merge count");
        assert_eq!(merges, 0);

        // Every retained particle's production vertex exists in MCVertices.
        let dangling = store
            .scalar_i64(
                "dangling",
                "SELECT COUNT(*) FROM MCParticles p \
                 LEFT JOIN MCVertices v ON p.production_vertex = v.mcvertex_id \
                 WHERE v.mcvertex_id IS NULL",
            )
            .expect("dangling count");
        assert_eq!(dangling, 0);
    }

    #[test]
    fn signal_status_sets_the_signal_flag() {
        let store = memory_store();
        run_selection(
            &store,
            vec![CollisionGraph {
                index: 0,
                vertices: vec![vertex(-1)],
                particles: vec![
                    particle(1, 511, 889, Some(-1), None),
                    particle(2, 211, 999, Some(-1), None),
                ],
                ..CollisionGraph::default()
            }],
        );

        let signal = store
            .scalar_i64(
                "signal_pid",
                "SELECT pid FROM MCParticles WHERE is_signal = 1",
            )
            .expect("signal row");
        assert_eq!(signal, 511);
    }

    #[test]
    fn cyclic_input_terminates_instead_of_recursing_forever() {
        let store = memory_store();
        // Malformed graph: particles 1 and 2 feed each other's vertices.
        run_selection(
            &store,
            vec![CollisionGraph {
                index: 0,
                vertices: vec![vertex(-1), vertex(-2)],
                particles: vec![
                    particle(1, 511, 777, Some(-1), Some(-2)),
                    particle(2, 521, 777, Some(-2), Some(-1)),
                ],
                ..CollisionGraph::default()
            }],
        );

        let n = store
            .scalar_i64("n_mcp", "SELECT COUNT(*) FROM MCParticles")
            .expect("count");
        assert!(n <= 2, "each particle is expanded at most once");
    }
}
