//! Loads generator event graphs into the store.
//!
//! One `load` call maps one input unit onto a `DataSources` row plus, per
//! collision sub-graph, its `GenEvents` row, vertices and particles.
//! Source-local vertex ids are only unique within a collision, so particle
//! links are resolved through an in-memory remap scoped to the sub-graph;
//! a reference to a vertex the source never declared becomes SQL `NULL`.

use crate::{
    db::EventStore,
    error::{ErrorOrigin, PipelineError},
    source::{CollisionGraph, EventSource, GraphParticle, GraphVertex},
};
use rusqlite::params;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

///
/// GraphLoader
///

#[derive(Clone, Copy, Debug, Default)]
pub struct GraphLoader;

impl GraphLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Load every collision of `source` under a new data-source record,
    /// inside one write transaction. Returns the data-source id.
    ///
    /// A reader failure mid-stream commits the collisions already inserted
    /// before propagating; partially loaded inputs are visible by design.
    pub fn load(
        &self,
        store: &EventStore,
        source: &mut dyn EventSource,
        source_label: &str,
        run_number: u64,
        evt_number: u64,
    ) -> Result<i64, PipelineError> {
        store.begin_transaction()?;
        let datasource_id = insert_datasource(store, source_label, run_number, evt_number)?;

        let streamed = stream_collisions(store, datasource_id, source);
        store.end_transaction()?;
        let n_collisions = streamed?;

        info!(
            source = source_label,
            run = run_number,
            event = evt_number,
            collisions = n_collisions,
            "loaded data source"
        );

        Ok(datasource_id)
    }
}

fn stream_collisions(
    store: &EventStore,
    datasource_id: i64,
    source: &mut dyn EventSource,
) -> Result<u64, PipelineError> {
    let mut n_collisions = 0;
    while let Some(graph) = source.next_collision()? {
        load_collision(store, datasource_id, &graph)?;
        n_collisions += 1;
    }

    Ok(n_collisions)
}

fn load_collision(
    store: &EventStore,
    datasource_id: i64,
    graph: &CollisionGraph,
) -> Result<(), PipelineError> {
    let genevent_id = insert_event(store, datasource_id, graph)?;

    // Vertices reachable from declared beam-particle end vertices are the
    // source representation's own primary markings.
    let primary_vertices: HashSet<i64> = graph
        .particles
        .iter()
        .filter(|p| graph.beam_particles.contains(&p.id))
        .filter_map(|p| p.end_vertex)
        .collect();

    let mut vertex_ids: HashMap<i64, i64> = HashMap::with_capacity(graph.vertices.len());
    for vertex in &graph.vertices {
        let row_id = insert_vertex(
            store,
            genevent_id,
            vertex,
            primary_vertices.contains(&vertex.id),
        )?;
        vertex_ids.insert(vertex.id, row_id);
    }

    for particle in &graph.particles {
        let production = resolve_link(&vertex_ids, particle.production_vertex);
        let end = resolve_link(&vertex_ids, particle.end_vertex);
        insert_particle(store, genevent_id, particle, production, end)?;
    }

    debug!(
        collision = graph.index,
        vertices = graph.vertices.len(),
        particles = graph.particles.len(),
        "loaded collision"
    );

    Ok(())
}

fn resolve_link(vertex_ids: &HashMap<i64, i64>, link: Option<i64>) -> Option<i64> {
    let source_id = link?;
    let resolved = vertex_ids.get(&source_id).copied();
    if resolved.is_none() {
        debug!(vertex = source_id, "dangling vertex reference stored as NULL");
    }

    resolved
}

fn insert_datasource(
    store: &EventStore,
    source_label: &str,
    run_number: u64,
    evt_number: u64,
) -> Result<i64, PipelineError> {
    store.statement(
        "insert_datasource",
        "INSERT INTO DataSources (datasource, run_number, evt_number) \
         VALUES (?1, ?2, ?3)",
        |stmt| {
            stmt.execute(params![source_label, run_number as i64, evt_number as i64])
                .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Loader, &e))?;
            Ok(())
        },
    )?;

    Ok(store.last_insert_rowid())
}

fn insert_event(
    store: &EventStore,
    datasource_id: i64,
    graph: &CollisionGraph,
) -> Result<i64, PipelineError> {
    store.statement(
        "insert_event",
        "INSERT INTO GenEvents (datasource_id, collision, t, x, y, z) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        |stmt| {
            stmt.execute(params![
                datasource_id,
                graph.index,
                graph.origin_t,
                graph.origin_x,
                graph.origin_y,
                graph.origin_z,
            ])
            .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Loader, &e))?;
            Ok(())
        },
    )?;

    Ok(store.last_insert_rowid())
}

fn insert_vertex(
    store: &EventStore,
    genevent_id: i64,
    vertex: &GraphVertex,
    is_primary: bool,
) -> Result<i64, PipelineError> {
    store.statement(
        "insert_vertex",
        "INSERT INTO GenVertices (genevent_id, hepmc_id, status, t, x, y, z, is_primary) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        |stmt| {
            stmt.execute(params![
                genevent_id,
                vertex.id,
                vertex.status,
                vertex.t,
                vertex.x,
                vertex.y,
                vertex.z,
                is_primary,
            ])
            .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Loader, &e))?;
            Ok(())
        },
    )?;

    Ok(store.last_insert_rowid())
}

fn insert_particle(
    store: &EventStore,
    genevent_id: i64,
    particle: &GraphParticle,
    production_vertex: Option<i64>,
    end_vertex: Option<i64>,
) -> Result<i64, PipelineError> {
    store.statement(
        "insert_particle",
        "INSERT INTO GenParticles (\
           genevent_id, hepmc_id, production_vertex, end_vertex, \
           pid, status, pe, px, py, pz, m) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        |stmt| {
            stmt.execute(params![
                genevent_id,
                particle.id,
                production_vertex,
                end_vertex,
                particle.pid,
                particle.status,
                particle.pe,
                particle.px,
                particle.py,
                particle.pz,
                particle.generated_mass,
            ])
            .map_err(|e| PipelineError::from_sqlite(ErrorOrigin::Loader, &e))?;
            Ok(())
        },
    )?;

    Ok(store.last_insert_rowid())
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
        source::VecEventSource,
    };
    use std::sync::Arc;

    fn memory_store() -> EventStore {
        EventStore::open(StoreLocation::Memory, Arc::new(PrngRegistry::new()), Some(1))
            .expect("open store")
    }

    fn two_vertex_collision(index: i64) -> CollisionGraph {
        CollisionGraph {
            index,
            vertices: vec![
                GraphVertex {
                    id: -1,
                    status: 0,
                    ..GraphVertex::default()
                },
                GraphVertex {
                    id: -2,
                    status: 0,
                    z: 5.0,
                    ..GraphVertex::default()
                },
            ],
            particles: vec![
                // beam particle ending at vertex -1
                GraphParticle {
                    id: 1,
                    pid: 2212,
                    status: 4,
                    production_vertex: None,
                    end_vertex: Some(-1),
                    pe: 7000.0,
                    px: 0.0,
                    py: 0.0,
                    pz: 7000.0,
                    generated_mass: 0.938,
                },
                GraphParticle {
                    id: 2,
                    pid: 511,
                    status: 777,
                    production_vertex: Some(-1),
                    end_vertex: Some(-2),
                    pe: 30.0,
                    px: 1.0,
                    py: 2.0,
                    pz: 25.0,
                    generated_mass: 5.28,
                },
            ],
            beam_particles: vec![1],
            ..CollisionGraph::default()
        }
    }

    #[test]
    fn load_remaps_collision_local_vertex_ids() {
        let store = memory_store();
        // Both collisions reuse the source-local vertex ids -1 and -2.
        let mut source =
            VecEventSource::new(vec![two_vertex_collision(0), two_vertex_collision(1)]);

        GraphLoader::new()
            .load(&store, &mut source, "unit.mc2", 456, 123)
            .expect("load");

        let vertices = store
            .scalar_i64("n_vertices", "SELECT COUNT(*) FROM GenVertices")
            .expect("count vertices");
        assert_eq!(vertices, 4, "vertex ids are remapped per collision");

        // Each particle's production vertex must live in its own collision.
        let cross_links = store
            .scalar_i64(
                "cross_links",
                "SELECT COUNT(*) FROM GenParticles p \
                 JOIN GenVertices v ON p.production_vertex = v.genvertex_id \
                 WHERE p.genevent_id != v.genevent_id",
            )
            .expect("count cross links");
        assert_eq!(cross_links, 0);
    }

    #[test]
    fn beam_end_vertices_are_marked_primary() {
        let store = memory_store();
        let mut source = VecEventSource::new(vec![two_vertex_collision(0)]);

        GraphLoader::new()
            .load(&store, &mut source, "unit.mc2", 1, 1)
            .expect("load");

        let primaries = store
            .scalar_i64(
                "n_primaries",
                "SELECT COUNT(*) FROM GenVertices WHERE is_primary = 1 AND hepmc_id = -1",
            )
            .expect("count primaries");
        assert_eq!(primaries, 1);
    }

    #[test]
    fn boundary_and_dangling_links_become_null() {
        let store = memory_store();
        let mut graph = two_vertex_collision(0);
        // Reference a vertex the source never declared.
        graph.particles.push(GraphParticle {
            id: 3,
            pid: 211,
            status: 1,
            production_vertex: Some(-2),
            end_vertex: Some(-99),
            pe: 1.0,
            px: 0.0,
            py: 0.0,
            pz: 1.0,
            generated_mass: 0.139,
        });
        let mut source = VecEventSource::new(vec![graph]);

        GraphLoader::new()
            .load(&store, &mut source, "unit.mc2", 1, 1)
            .expect("load");

        let nulls = store
            .scalar_i64(
                "null_links",
                "SELECT COUNT(*) FROM GenParticles \
                 WHERE production_vertex IS NULL OR end_vertex IS NULL",
            )
            .expect("count nulls");
        // Beam particle has no production vertex; the dangling end vertex
        // of particle 3 is stored as NULL.
        assert_eq!(nulls, 2);
    }

    #[test]
    fn datasource_row_carries_run_and_event_numbers() {
        let store = memory_store();
        let mut source = VecEventSource::new(vec![]);

        let id = GraphLoader::new()
            .load(&store, &mut source, "empty.mc2", 456, 789)
            .expect("load");
        assert_eq!(id, 1);

        let run = store
            .scalar_i64("run", "SELECT run_number FROM DataSources WHERE datasource_id = 1")
            .expect("run number");
        assert_eq!(run, 456);
    }
}
