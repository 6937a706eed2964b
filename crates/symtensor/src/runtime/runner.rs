//! Fluent run builder over a session.

use anyhow::Result;

use crate::backend::spec::{GraphBackend, NodeId, Output, RunMetadata, RunOptions, Status};
use crate::error::Error;
use crate::runtime::session::Session;

/// Accumulates feeds, fetches, and targets before triggering one execution.
///
/// Inputs are added together with their values, so the two cardinalities can
/// never diverge. Name-based overloads resolve their port immediately, which
/// also means a bad name fails at build time rather than inside `run`.
pub struct Runner<'s, B: GraphBackend> {
    session: &'s Session<B>,
    feeds: Vec<(Output, B::Tensor)>,
    fetches: Vec<Output>,
    targets: Vec<NodeId>,
    options: Option<RunOptions>,
    metadata: RunMetadata,
}

impl<'s, B: GraphBackend> Runner<'s, B> {
    pub(crate) fn new(session: &'s Session<B>) -> Self {
        Runner {
            session,
            feeds: Vec::new(),
            fetches: Vec::new(),
            targets: Vec::new(),
            options: None,
            metadata: RunMetadata::default(),
        }
    }

    /// Feeds `value` into the given placeholder output.
    pub fn add_input(mut self, port: Output, value: B::Tensor) -> Self {
        self.feeds.push((port, value));
        self
    }

    /// Feeds `value` into the placeholder named by `name` (or `name:idx`).
    pub fn add_input_named(self, name: &str, value: B::Tensor) -> Result<Self> {
        let port = self.session.graph().output_by_name(name)?;
        Ok(self.add_input(port, value))
    }

    /// Adds an output to fetch.
    pub fn fetch(mut self, port: Output) -> Self {
        self.fetches.push(port);
        self
    }

    /// Adds a fetch by `op` or `op:idx` name.
    pub fn fetch_named(self, name: &str) -> Result<Self> {
        let port = self.session.graph().output_by_name(name)?;
        Ok(self.fetch(port))
    }

    /// Adds an operation to execute without fetching its value.
    pub fn add_target(mut self, target: NodeId) -> Self {
        self.targets.push(target);
        self
    }

    pub fn add_target_named(self, name: &str) -> Result<Self> {
        let node = self
            .session
            .graph()
            .operation_by_name(name)
            .ok_or_else(|| Error::bad_argument("target", format!("no operation named '{name}'")))?;
        Ok(self.add_target(node))
    }

    /// Overrides the opaque options buffer forwarded to the backend.
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// The metadata buffer the backend may have filled during the last run.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Executes once with everything accumulated so far.
    pub fn run(&mut self) -> Result<Vec<B::Tensor>> {
        self.session.run_with_options(
            &self.feeds,
            &self.fetches,
            &self.targets,
            self.options.as_ref(),
            Some(&mut self.metadata),
        )
    }

    /// Records the outcome in `status` instead of raising; returns the
    /// fetched tensors on success.
    pub fn run_with_status(&mut self, status: &mut Status) -> Option<Vec<B::Tensor>> {
        status.reset();
        match self.run() {
            Ok(tensors) => Some(tensors),
            Err(err) => {
                match err.downcast::<crate::backend::spec::BackendError>() {
                    Ok(backend_err) => status.record(&backend_err),
                    Err(other) => status.record(&crate::backend::spec::BackendError::execution(
                        other.to_string(),
                    )),
                }
                None
            }
        }
    }

    /// Convenience single-fetch run: clears accumulated fetches, fetches
    /// only `port`, and returns its value.
    pub fn run_single(&mut self, port: Output) -> Result<B::Tensor> {
        self.fetches.clear();
        self.fetches.push(port);
        let mut tensors = self.run()?;
        tensors
            .pop()
            .ok_or_else(|| Error::bad_argument("run", "backend returned no outputs").into())
    }
}
