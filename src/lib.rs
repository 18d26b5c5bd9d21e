#[cfg(feature = "python")]
use pyo3::prelude::*;

// Declare all library modules to make them accessible.
pub mod answer;
pub mod classifier;
pub mod client;
pub mod config;
pub mod datam;
pub mod embed;
pub mod error;
pub mod executor;
pub mod keys;
pub mod orchestra;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod repair;
pub mod retrieval;
pub mod schema;
pub mod sqlgen;
pub mod usage;
pub mod vector;

#[cfg(feature = "python")]
pub mod bindings {
    pub mod python_b;
}

pub use error::{CoreError, ErrorKind, Result};
pub use pipeline::{Answer, Orchestrator, Question, Response};

/// This is the main entry point for the Python module.
/// The function name (`_finqa_core`) must match the module name the wheel exposes.
#[cfg(feature = "python")]
#[pymodule]
fn _finqa_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<bindings::python_b::PyFinQA>()?;
    Ok(())
}
