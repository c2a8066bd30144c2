//! HepMC2 `IO_GenEvent` ASCII reader.
//!
//! Implements [`parsim::source::EventSource`] over the line-oriented
//! HepMC2 format: an `E` record opens an event, `V` records declare
//! vertices, and the `P` records following a vertex take it as their
//! production vertex. Values are passed through in the units the file
//! declares; no conversion is applied.
//!
//! Malformed records terminate the stream early (the event being read is
//! dropped); everything already handed out stays valid. This mirrors the
//! failure contract of the graph loader, which commits the collisions it
//! has seen.

use parsim::{
    error::{ErrorOrigin, PipelineError},
    source::{CollisionGraph, EventSource, GraphParticle, GraphVertex},
};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tracing::warn;

const END_OF_LISTING: &str = "HepMC::IO_GenEvent-END_EVENT_LISTING";

/// Event-level fields carried over from an `E` record.
#[derive(Debug)]
struct EventHeader {
    event_number: i64,
    beam_barcodes: Vec<i64>,
}

///
/// HepMc2Reader
///

#[derive(Debug)]
pub struct HepMc2Reader<R> {
    input: R,
    pending: Option<EventHeader>,
    done: bool,
}

impl HepMc2Reader<BufReader<File>> {
    /// Open a HepMC2 ASCII file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            PipelineError::config(
                ErrorOrigin::Loader,
                format!("cannot open event file '{}': {err}", path.display()),
            )
        })?;

        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> HepMc2Reader<R> {
    #[must_use]
    pub const fn new(input: R) -> Self {
        Self {
            input,
            pending: None,
            done: false,
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line),
            Err(err) => {
                warn!(error = %err, "read failure, ending event stream");
                self.done = true;
                None
            }
        }
    }

    /// Scan forward to the next `E` record, skipping headers, comments and
    /// the records this reader does not consume (`N`, `U`, `C`, `H`, `F`).
    fn next_header(&mut self) -> Option<EventHeader> {
        if let Some(header) = self.pending.take() {
            return Some(header);
        }

        while let Some(line) = self.next_line() {
            let line = line.trim_end();
            if line.starts_with(END_OF_LISTING) {
                self.done = true;
                return None;
            }
            if line.starts_with("E ") {
                match parse_event_record(line) {
                    Some(header) => return Some(header),
                    None => {
                        warn!(record = line, "malformed event record, ending event stream");
                        self.done = true;
                        return None;
                    }
                }
            }
        }

        None
    }
}

impl<R: BufRead> EventSource for HepMc2Reader<R> {
    fn next_collision(&mut self) -> Result<Option<CollisionGraph>, PipelineError> {
        if self.done {
            return Ok(None);
        }

        let Some(header) = self.next_header() else {
            return Ok(None);
        };

        let mut graph = CollisionGraph {
            index: header.event_number,
            ..CollisionGraph::default()
        };
        let mut current_vertex: Option<i64> = None;

        loop {
            let Some(line) = self.next_line() else {
                break;
            };
            let line = line.trim_end();

            if line.starts_with(END_OF_LISTING) {
                self.done = true;
                break;
            }
            if line.starts_with("E ") {
                // Next event: stash its header and close this one.
                match parse_event_record(line) {
                    Some(next) => self.pending = Some(next),
                    None => {
                        warn!(record = line, "malformed event record, ending event stream");
                        self.done = true;
                    }
                }
                break;
            }

            if line.starts_with("V ") {
                let Some(vertex) = parse_vertex_record(line) else {
                    warn!(record = line, "malformed vertex record, ending event stream");
                    self.done = true;
                    return Ok(None);
                };
                current_vertex = Some(vertex.id);
                graph.vertices.push(vertex);
            } else if line.starts_with("P ") {
                let Some(particle) = parse_particle_record(line, current_vertex) else {
                    warn!(record = line, "malformed particle record, ending event stream");
                    self.done = true;
                    return Ok(None);
                };
                graph.particles.push(particle);
            }
            // N, U, C, H, F and comment records are skipped.
        }

        graph.beam_particles = header
            .beam_barcodes
            .iter()
            .copied()
            .filter(|barcode| graph.particles.iter().any(|p| p.id == *barcode))
            .collect();
        // Files predating the beam fields mark beams with status 4.
        for particle in &graph.particles {
            if particle.status == 4 && !graph.beam_particles.contains(&particle.id) {
                graph.beam_particles.push(particle.id);
            }
        }

        Ok(Some(graph))
    }
}

/// `E evt mpi scale aqcd aqed signal_id signal_vtx n_vtx beam1 beam2 ...`
fn parse_event_record(line: &str) -> Option<EventHeader> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let event_number: i64 = fields.get(1)?.parse().ok()?;

    let mut beam_barcodes = Vec::new();
    for index in [9, 10] {
        if let Some(barcode) = fields.get(index).and_then(|f| f.parse::<i64>().ok()) {
            if barcode != 0 {
                beam_barcodes.push(barcode);
            }
        }
    }

    Some(EventHeader {
        event_number,
        beam_barcodes,
    })
}

/// `V barcode status x y z ctau n_orphan n_out n_weights`
fn parse_vertex_record(line: &str) -> Option<GraphVertex> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    Some(GraphVertex {
        id: fields.get(1)?.parse().ok()?,
        status: fields.get(2)?.parse().ok()?,
        x: fields.get(3)?.parse().ok()?,
        y: fields.get(4)?.parse().ok()?,
        z: fields.get(5)?.parse().ok()?,
        t: fields.get(6)?.parse().ok()?,
    })
}

/// `P barcode pid px py pz e mass status pol_theta pol_phi end_vtx n_flow ...`
fn parse_particle_record(line: &str, production_vertex: Option<i64>) -> Option<GraphParticle> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    let end_vertex: i64 = fields.get(11)?.parse().ok()?;
    Some(GraphParticle {
        id: fields.get(1)?.parse().ok()?,
        pid: fields.get(2)?.parse().ok()?,
        px: fields.get(3)?.parse().ok()?,
        py: fields.get(4)?.parse().ok()?,
        pz: fields.get(5)?.parse().ok()?,
        pe: fields.get(6)?.parse().ok()?,
        generated_mass: fields.get(7)?.parse().ok()?,
        status: fields.get(8)?.parse().ok()?,
        production_vertex,
        end_vertex: (end_vertex != 0).then_some(end_vertex),
    })
}

///
/// TESTS
///
