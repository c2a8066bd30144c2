//! Custom scalar SQL functions registered on every store connection.
//!
//! Geometry and kinematics helpers are deterministic; the `random_*`
//! family draws from the generator bound to the connection, so SQL-level
//! randomness follows the same reproducibility contract as the plugins.

use crate::{
    error::{ErrorOrigin, PipelineError},
    prng::{self, PrngRegistry, PrngToken},
};
use rand::Rng;
use rand_distr::StandardNormal;
use rusqlite::{
    Connection,
    functions::{Context, FunctionFlags},
};
use std::sync::Arc;

/// Tolerance for the categorical weight-sum check; weights are caller
/// supplied floats and may carry rounding noise.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

pub(crate) fn register_all(
    conn: &Connection,
    registry: &Arc<PrngRegistry>,
    token: PrngToken,
) -> Result<(), PipelineError> {
    register_geometry(conn).map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Functions, &err))?;
    register_random(conn, registry, token)
        .map_err(|err| PipelineError::from_sqlite(ErrorOrigin::Functions, &err))
}

const DETERMINISTIC: FunctionFlags = FunctionFlags::SQLITE_UTF8.union(FunctionFlags::SQLITE_DETERMINISTIC);

fn register_geometry(conn: &Connection) -> rusqlite::Result<()> {
    // norm2(a, b, ...): Euclidean norm of its arguments.
    conn.create_scalar_function("norm2", -1, DETERMINISTIC, |ctx| {
        let mut sum = 0.0_f64;
        for i in 0..ctx.len() {
            let v = ctx.get::<f64>(i)?;
            sum += v * v;
        }
        Ok(sum.sqrt())
    })?;

    // pseudorapidity(x, y, z): -ln(tan(theta/2)) of the direction (x, y, z).
    conn.create_scalar_function("pseudorapidity", 3, DETERMINISTIC, |ctx| {
        let theta = polar_angle(ctx)?;
        Ok(-(0.5 * theta).tan().ln())
    })?;

    // polar(x, y, z): polar angle of the direction (x, y, z).
    conn.create_scalar_function("polar", 3, DETERMINISTIC, |ctx| polar_angle(ctx))?;

    // azimuthal(x, y, z): azimuthal angle of the direction (x, y, z).
    conn.create_scalar_function("azimuthal", 3, DETERMINISTIC, |ctx| {
        let x = ctx.get::<f64>(0)?;
        let y = ctx.get::<f64>(1)?;
        Ok(y.atan2(x))
    })?;

    // propagation_charge(pid): charge sign relevant to propagation for the
    // species the detector model tracks; NULL for anything else.
    conn.create_scalar_function("propagation_charge", 1, DETERMINISTIC, |ctx| {
        let pid = ctx.get::<i64>(0)?;
        let sign = if pid > 0 { 1_i64 } else { -1_i64 };

        let charge = match pid.abs() {
            // charged leptons: particle has negative charge
            11 | 13 | 15 => Some(-sign),
            // hadron tracks: pi+, K+, p
            211 | 321 | 2212 => Some(sign),
            // photons and neutrons
            22 | 2112 => Some(0),
            _ => None,
        };
        Ok(charge)
    })?;

    // slopes_to_cartesian(icoord, p, tx, ty): cartesian momentum component
    // (icoord 0/1/2 -> x/y/z) of a track with magnitude p and slopes
    // tx = px/pz, ty = py/pz.
    conn.create_scalar_function("slopes_to_cartesian", 4, DETERMINISTIC, |ctx| {
        let icoord = ctx.get::<i64>(0)?;
        let p = ctx.get::<f64>(1)?;
        let tx = ctx.get::<f64>(2)?;
        let ty = ctx.get::<f64>(3)?;

        let pz = p / (1.0 + tx * tx + ty * ty).sqrt();
        match icoord {
            0 => Ok(tx * pz),
            1 => Ok(ty * pz),
            2 => Ok(pz),
            _ => Err(user_error(PipelineError::config(
                ErrorOrigin::Functions,
                format!("slopes_to_cartesian: coordinate index {icoord} out of range"),
            ))),
        }
    })?;

    // z_closest_to_beam(x0, y0, z0, tx, ty): z of the point of closest
    // approach to the beam axis of the straight line through (x0, y0, z0)
    // with slopes (tx, ty).
    conn.create_scalar_function("z_closest_to_beam", 5, DETERMINISTIC, |ctx| {
        let x0 = ctx.get::<f64>(0)?;
        let y0 = ctx.get::<f64>(1)?;
        let z0 = ctx.get::<f64>(2)?;
        let tx = ctx.get::<f64>(3)?;
        let ty = ctx.get::<f64>(4)?;

        let slope2 = tx * tx + ty * ty;
        if slope2 == 0.0 {
            Ok(z0)
        } else {
            Ok(z0 - (x0 * tx + y0 * ty) / slope2)
        }
    })?;

    Ok(())
}

fn register_random(
    conn: &Connection,
    registry: &Arc<PrngRegistry>,
    token: PrngToken,
) -> rusqlite::Result<()> {
    let handle = Arc::clone(registry);
    conn.create_scalar_function("random_uniform", 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
        let generator = connection_generator(&handle, token)?;
        let value: f64 = prng::lock(&generator).random();
        Ok(value)
    })?;

    let handle = Arc::clone(registry);
    conn.create_scalar_function("random_normal", 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
        let generator = connection_generator(&handle, token)?;
        let value: f64 = prng::lock(&generator).sample(StandardNormal);
        Ok(value)
    })?;

    // random_category(p1, ..., pn): categorical draw by cumulative weight.
    // Weights must be non-negative and sum to at most one; the remainder
    // is the implicit overflow category with index n.
    let handle = Arc::clone(registry);
    conn.create_scalar_function("random_category", -1, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let mut weights = Vec::with_capacity(ctx.len());
        for i in 0..ctx.len() {
            weights.push(ctx.get::<f64>(i)?);
        }
        validate_weights(&weights).map_err(user_error)?;

        let generator = connection_generator(&handle, token)?;
        let r: f64 = prng::lock(&generator).random();
        Ok(categorical_index(r, &weights) as i64)
    })?;

    Ok(())
}

fn connection_generator(
    registry: &Arc<PrngRegistry>,
    token: PrngToken,
) -> rusqlite::Result<prng::SharedGenerator> {
    registry.get_or_create(token, None).map_err(user_error)
}

fn user_error(err: PipelineError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn polar_angle(ctx: &Context<'_>) -> rusqlite::Result<f64> {
    let x = ctx.get::<f64>(0)?;
    let y = ctx.get::<f64>(1)?;
    let z = ctx.get::<f64>(2)?;
    Ok(x.hypot(y).atan2(z))
}

/// Index of the category selected by a uniform draw `r` against the
/// cumulative weights; the remainder maps to index `weights.len()`.
pub(crate) fn categorical_index(r: f64, weights: &[f64]) -> usize {
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if r < cumulative {
            return index;
        }
    }

    weights.len()
}

pub(crate) fn validate_weights(weights: &[f64]) -> Result<(), PipelineError> {
    if weights.iter().any(|w| *w < 0.0) {
        return Err(PipelineError::config(
            ErrorOrigin::Functions,
            "categorical weights must be non-negative",
        ));
    }

    let total: f64 = weights.iter().sum();
    if total > 1.0 + WEIGHT_SUM_TOLERANCE {
        return Err(PipelineError::config(
            ErrorOrigin::Functions,
            format!("categorical weights sum to {total}, exceeding one"),
        ));
    }

    Ok(())
}

///
/// TESTS
///
