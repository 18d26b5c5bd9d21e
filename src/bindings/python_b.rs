use pyo3::prelude::*;
use pyo3::{pyclass, pymethods, PyObject, PyResult, Python};
use serde_pyobject::to_pyobject;

use crate::config::Settings;
use crate::pipeline::{Orchestrator, Question};

// --- Python Bindings for the question-answering pipeline ---

#[pyclass(name = "FinQA")]
pub struct PyFinQA {
    orchestrator: Orchestrator,
}

#[pymethods]
impl PyFinQA {
    /// Builds the pipeline from `FINQA_*` environment variables.
    #[staticmethod]
    fn from_env(py: Python<'_>) -> PyResult<Self> {
        let orchestrator = py.allow_threads(|| {
            let settings = Settings::from_env()?;
            Orchestrator::from_settings(&settings)
        })?;
        Ok(Self { orchestrator })
    }

    /// Answers a question. Returns the response payload as a dict; failures are
    /// payloads too (`error`, `kind`, `status`), never exceptions.
    #[pyo3(signature = (question, company = None, session_id = None))]
    fn ask(
        &self,
        py: Python<'_>,
        question: String,
        company: Option<String>,
        session_id: Option<String>,
    ) -> PyResult<PyObject> {
        let question = Question {
            text: question,
            company,
            session_id,
        };
        let response = py.allow_threads(|| self.orchestrator.answer(&question));
        Ok(to_pyobject(py, &response)?.unbind())
    }

    /// Returns "numerical" or "contextual".
    fn classify(&self, question: &str) -> &'static str {
        self.orchestrator.classify(question).as_str()
    }
}
