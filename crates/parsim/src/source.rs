//! Typed records produced by generator-event readers.
//!
//! Readers are external collaborators: they expose a pull-style stream of
//! collision sub-graphs and know nothing about the event store. The loader
//! (see [`crate::load`]) owns the mapping onto relational rows.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

///
/// GraphVertex
/// One generator-level vertex, ids local to its collision.
///

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GraphVertex {
    pub id: i64,
    pub status: i64,
    pub t: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

///
/// GraphParticle
/// One generator-level particle; vertex references use the collision-local
/// vertex ids, `None` marks a graph boundary (incoming/outgoing beam).
///

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GraphParticle {
    pub id: i64,
    pub pid: i64,
    pub status: i64,
    pub production_vertex: Option<i64>,
    pub end_vertex: Option<i64>,
    pub pe: f64,
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub generated_mass: f64,
}

///
/// CollisionGraph
///
/// One independent interaction sub-graph of a loaded input unit: its index
/// as declared by the source, its origin 4-position, the vertex and
/// particle sets, and the ids of beam particles whose end vertices are
/// candidate primary vertices.
///

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CollisionGraph {
    pub index: i64,
    pub origin_t: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub origin_z: f64,
    pub vertices: Vec<GraphVertex>,
    pub particles: Vec<GraphParticle>,
    pub beam_particles: Vec<i64>,
}

///
/// EventSource
/// Pull-style reader of collision sub-graphs.
///

pub trait EventSource {
    /// Read the next collision sub-graph, or `None` when the stream is
    /// exhausted (including early exhaustion on malformed input).
    fn next_collision(&mut self) -> Result<Option<CollisionGraph>, PipelineError>;
}

/// In-memory source over pre-built collision graphs; the test and
/// embedding companion to file-backed readers.
pub struct VecEventSource {
    collisions: std::vec::IntoIter<CollisionGraph>,
}

impl VecEventSource {
    #[must_use]
    pub fn new(collisions: Vec<CollisionGraph>) -> Self {
        Self {
            collisions: collisions.into_iter(),
        }
    }
}

impl EventSource for VecEventSource {
    fn next_collision(&mut self) -> Result<Option<CollisionGraph>, PipelineError> {
        Ok(self.collisions.next())
    }
}
