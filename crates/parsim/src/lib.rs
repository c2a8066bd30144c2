//! Core runtime for parsim: the relational event store, the seeded PRNG
//! registry, and the pipeline stages that reduce generator-level event
//! graphs into a reconstructed decay tree.
//!
//! A pipeline driver owns an [`db::EventStore`] and a [`prng::PrngRegistry`],
//! loads generator graphs through [`load::GraphLoader`], and then runs the
//! stages ([`pv::PvFinder`], [`select::ParticleSelector`],
//! [`pv::PvReconstruction`], [`plugin::Plugin`], ...) in a fixed order via
//! [`pipeline::run_pipeline`].

// public exports are one module level down
pub mod db;
pub mod error;
pub mod load;
pub mod maintenance;
pub mod pipeline;
pub mod plugin;
pub mod prng;
pub mod pv;
pub mod select;
pub mod source;
pub mod table;

///
/// CONSTANTS
///

/// Reconstructed vertex category: primary interaction point.
pub const VERTEX_TYPE_PRIMARY: i64 = 1;

/// Reconstructed vertex category: produced in a decay.
pub const VERTEX_TYPE_FROM_DECAY: i64 = 2;

/// Reconstructed vertex category: origin not classified.
pub const VERTEX_TYPE_UNKNOWN: i64 = -1;

/// Generator status: stable in the production generator.
pub const STATUS_STABLE_IN_PRODGEN: i64 = 1;

/// Generator status: decayed by the decay generator.
pub const STATUS_DECAYED_BY_DECAYGEN: i64 = 777;

/// Generator status: decayed by the decay generator, produced by the
/// production generator.
pub const STATUS_DECAYED_AND_PRODUCED: i64 = 888;

/// Generator status: signal particle in the laboratory frame.
pub const STATUS_SIGNAL_IN_LAB_FRAME: i64 = 889;

/// Generator status: signal particle at rest.
pub const STATUS_SIGNAL_AT_REST: i64 = 998;

/// Generator status: stable in the decay generator.
pub const STATUS_STABLE_IN_DECAYGEN: i64 = 999;

///
/// Prelude
///
/// Prelude contains the pipeline vocabulary only.
/// Internal statement plumbing and helpers are not re-exported here.
///

pub mod prelude {
    pub use crate::{
        db::{EventStore, StoreLocation},
        error::{ErrorClass, ErrorOrigin, PipelineError},
        load::GraphLoader,
        maintenance::{CleanEventStore, EditEventStore, UpdateConnection},
        pipeline::{Transformer, run_pipeline},
        plugin::{GenerativePlugin, Plugin},
        prng::PrngRegistry,
        pv::{PvFinder, PvReconstruction, SmearingParametrization},
        select::ParticleSelector,
        source::{CollisionGraph, EventSource, GraphParticle, GraphVertex},
        table::TemporaryTable,
    };
}
