//! Sessions: execution contexts binding a graph to a backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::backend::graph::Graph;
use crate::backend::spec::{
    DeviceAttributes, GraphBackend, NodeId, Output, RunMetadata, RunOptions,
};
use crate::error::Error;
use crate::runtime::runner::Runner;

/// An execution context owning a graph and driving a backend.
///
/// Sessions are thread-safe disposables: `run` may be called concurrently
/// from distinct threads, each call blocking until the backend finishes, and
/// `close` flips every subsequent operation into a [`Error::DisposedHandle`].
pub struct Session<B: GraphBackend> {
    backend: Arc<B>,
    graph: Graph,
    closed: AtomicBool,
}

impl<B: GraphBackend> Session<B> {
    pub fn new(backend: Arc<B>, graph: Graph) -> Self {
        Session {
            backend,
            graph,
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Marks the session disposed. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::DisposedHandle { handle: "session" })
        } else {
            Ok(())
        }
    }

    /// Executes the subgraph required for `fetches` and `targets`, blocking
    /// until the backend returns. Returns one tensor per fetch, in order.
    pub fn run(
        &self,
        feeds: &[(Output, B::Tensor)],
        fetches: &[Output],
        targets: &[NodeId],
    ) -> Result<Vec<B::Tensor>> {
        self.run_with_options(feeds, fetches, targets, None, None)
    }

    pub fn run_with_options(
        &self,
        feeds: &[(Output, B::Tensor)],
        fetches: &[Output],
        targets: &[NodeId],
        options: Option<&RunOptions>,
        metadata: Option<&mut RunMetadata>,
    ) -> Result<Vec<B::Tensor>> {
        self.ensure_open()?;
        let tensors = self
            .backend
            .run(&self.graph, feeds, fetches, targets, options, metadata)?;
        Ok(tensors)
    }

    /// Starts building a run with the fluent [`Runner`] surface.
    pub fn runner(&self) -> Runner<'_, B> {
        Runner::new(self)
    }

    /// Obtains a token for stepwise execution over the declared feeds,
    /// fetches, and targets.
    pub fn partial_run_setup(
        &self,
        feeds: &[Output],
        fetches: &[Output],
        targets: &[NodeId],
    ) -> Result<PartialRunToken<B>> {
        self.ensure_open()?;
        let state = self
            .backend
            .partial_run_setup(&self.graph, feeds, fetches, targets)?;
        Ok(PartialRunToken {
            backend: Arc::clone(&self.backend),
            state: Some(state),
        })
    }

    /// Executes one step of a partial run: feed some inputs, fetch some
    /// outputs, keep the rest of the state alive for later steps.
    pub fn partial_run(
        &self,
        token: &mut PartialRunToken<B>,
        feeds: &[(Output, B::Tensor)],
        fetches: &[Output],
    ) -> Result<Vec<B::Tensor>> {
        self.ensure_open()?;
        let state = token
            .state
            .as_mut()
            .ok_or(Error::DisposedHandle {
                handle: "partial-run token",
            })?;
        let tensors = self.backend.partial_run(&self.graph, state, feeds, fetches)?;
        Ok(tensors)
    }

    pub fn devices(&self) -> Result<Vec<DeviceAttributes>> {
        self.ensure_open()?;
        Ok(self.backend.devices()?)
    }
}

/// Owns the backend state of one partial run.
///
/// The underlying handle is released exactly once: either through an
/// explicit [`PartialRunToken::close`] or when the token is dropped.
pub struct PartialRunToken<B: GraphBackend> {
    backend: Arc<B>,
    state: Option<B::PartialRunState>,
}

impl<B: GraphBackend> PartialRunToken<B> {
    /// Releases the underlying handle now instead of at drop time.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            self.backend.release_partial_run(state);
        }
    }
}

impl<B: GraphBackend> Drop for PartialRunToken<B> {
    fn drop(&mut self) {
        self.release();
    }
}
