//! Capability boundary to externally compiled parametrization kernels.
//!
//! ABI contract, independent of the host language: the kernel receives a
//! caller-owned output buffer and a read-only input buffer of f32 features
//! (the generative form adds a read-only buffer of standard-normal draws),
//! and writes exactly as many floats as the caller configured output
//! columns. Buffer sizes are fixed by the plugin configuration and never
//! communicated to the kernel at run time.

use crate::error::{ErrorOrigin, PipelineError};
use libloading::Library;

/// Deterministic kernel: `outputs <- f(inputs)`.
pub type DeterministicFn = unsafe extern "C" fn(*mut f32, *const f32) -> *mut f32;

/// Generative kernel: `outputs <- f(inputs, random)`.
pub type GenerativeFn = unsafe extern "C" fn(*mut f32, *const f32, *const f32) -> *mut f32;

fn load_library(library_path: &str) -> Result<Library, PipelineError> {
    // SAFETY: loading a shared object runs its initializers; the module is
    // part of the deployment, declared by the caller, not untrusted input.
    unsafe { Library::new(library_path) }.map_err(|err| {
        PipelineError::config(
            ErrorOrigin::Plugin,
            format!("cannot load module '{library_path}': {err}"),
        )
    })
}

macro_rules! resolve_symbol {
    ($library:expr, $library_path:expr, $symbol:expr, $fn_type:ty) => {{
        // SAFETY: the symbol is declared by the caller to match the ABI
        // contract above; a mismatch is a deployment error.
        let resolved = unsafe { $library.get::<$fn_type>($symbol.as_bytes()) };
        resolved.map(|sym| *sym).map_err(|err| {
            PipelineError::config(
                ErrorOrigin::Plugin,
                format!(
                    "cannot resolve symbol '{}' in module '{}': {err}",
                    $symbol, $library_path
                ),
            )
        })
    }};
}

///
/// DeterministicKernel
///

#[derive(Debug)]
pub struct DeterministicKernel {
    // Keeps the shared object mapped for as long as the function pointer
    // may be called.
    _library: Option<Library>,
    func: DeterministicFn,
}

impl DeterministicKernel {
    /// Resolve `symbol` from the shared module at `library_path`.
    pub fn load(library_path: &str, symbol: &str) -> Result<Self, PipelineError> {
        let library = load_library(library_path)?;
        let func = resolve_symbol!(library, library_path, symbol, DeterministicFn)?;

        Ok(Self {
            _library: Some(library),
            func,
        })
    }

    /// Wrap an in-process kernel honoring the same ABI contract.
    #[must_use]
    pub const fn from_fn(func: DeterministicFn) -> Self {
        Self {
            _library: None,
            func,
        }
    }

    pub(crate) fn eval(&self, output: &mut [f32], input: &[f32]) {
        // SAFETY: per the ABI contract the kernel writes exactly
        // `output.len()` floats and reads exactly the configured number of
        // inputs; both buffers outlive the call.
        unsafe {
            (self.func)(output.as_mut_ptr(), input.as_ptr());
        }
    }
}

///
/// GenerativeKernel
///

#[derive(Debug)]
pub struct GenerativeKernel {
    _library: Option<Library>,
    func: GenerativeFn,
}

impl GenerativeKernel {
    /// Resolve `symbol` from the shared module at `library_path`.
    pub fn load(library_path: &str, symbol: &str) -> Result<Self, PipelineError> {
        let library = load_library(library_path)?;
        let func = resolve_symbol!(library, library_path, symbol, GenerativeFn)?;

        Ok(Self {
            _library: Some(library),
            func,
        })
    }

    /// Wrap an in-process kernel honoring the same ABI contract.
    #[must_use]
    pub const fn from_fn(func: GenerativeFn) -> Self {
        Self {
            _library: None,
            func,
        }
    }

    pub(crate) fn eval(&self, output: &mut [f32], input: &[f32], random: &[f32]) {
        // SAFETY: see the ABI contract; the random segment is sized to the
        // configured feature count.
        unsafe {
            (self.func)(output.as_mut_ptr(), input.as_ptr(), random.as_ptr());
        }
    }
}

///
/// TESTS
///
