//! Event-store schema.
//!
//! All DDL is idempotent so a reopened file-backed store keeps its data.
//! Booleans are 0/1 integers; a missing graph link is SQL `NULL`.
//! `AUTOINCREMENT` keeps store-assigned keys monotonic even after the
//! duplicate-primary guard deletes rows.

pub(crate) const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS DataSources (
  datasource_id     INTEGER PRIMARY KEY AUTOINCREMENT,
  datasource        TEXT,
  run_number        INTEGER,
  evt_number        INTEGER
);

CREATE TABLE IF NOT EXISTS GenEvents (
  genevent_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  datasource_id     INTEGER REFERENCES DataSources (datasource_id),
  collision         INTEGER,
  t REAL, x REAL, y REAL, z REAL
);

CREATE TABLE IF NOT EXISTS GenVertices (
  genvertex_id      INTEGER PRIMARY KEY AUTOINCREMENT,
  genevent_id       INTEGER REFERENCES GenEvents (genevent_id),
  hepmc_id          INTEGER,
  status            INTEGER,
  t REAL, x REAL, y REAL, z REAL,
  is_primary        INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS GenParticles (
  genparticle_id    INTEGER PRIMARY KEY AUTOINCREMENT,
  genevent_id       INTEGER REFERENCES GenEvents (genevent_id),
  hepmc_id          INTEGER,
  production_vertex INTEGER REFERENCES GenVertices (genvertex_id),
  end_vertex        INTEGER REFERENCES GenVertices (genvertex_id),
  pid               INTEGER,
  status            INTEGER,
  pe REAL, px REAL, py REAL, pz REAL, m REAL
);

CREATE TABLE IF NOT EXISTS MCVertices (
  mcvertex_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  genvertex_id      INTEGER UNIQUE REFERENCES GenVertices (genvertex_id),
  genevent_id       INTEGER REFERENCES GenEvents (genevent_id),
  status            INTEGER,
  is_primary        INTEGER DEFAULT 0,
  t REAL, x REAL, y REAL, z REAL
);

CREATE TABLE IF NOT EXISTS MCParticles (
  mcparticle_id     INTEGER PRIMARY KEY AUTOINCREMENT,
  genparticle_id    INTEGER REFERENCES GenParticles (genparticle_id),
  genevent_id       INTEGER REFERENCES GenEvents (genevent_id),
  pid               INTEGER,
  pe REAL, px REAL, py REAL, pz REAL, m REAL,
  is_signal         INTEGER DEFAULT 0,
  production_vertex INTEGER REFERENCES MCVertices (mcvertex_id),
  end_vertex        INTEGER REFERENCES MCVertices (mcvertex_id)
);

CREATE TABLE IF NOT EXISTS Vertices (
  vertex_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  mcvertex_id       INTEGER REFERENCES MCVertices (mcvertex_id),
  genevent_id       INTEGER REFERENCES GenEvents (genevent_id),
  vertex_type       INTEGER,
  x REAL, y REAL, z REAL,
  sigma_x REAL, sigma_y REAL, sigma_z REAL
);
";
