//! Graph construction with named operations and scoped name prefixes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::backend::spec::{Node, NodeId, Operation, Output, TensorSpec};
use crate::error::Error;

/// An append-only computation graph.
///
/// Nodes are recorded in insertion order, which is also a valid topological
/// order because every operand must already exist when a node is added.
/// Construction is internally locked so a graph can be shared with a session
/// that runs on another thread.
pub struct Graph {
    inner: Mutex<GraphInner>,
}

#[derive(Default)]
struct GraphInner {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    scopes: Vec<String>,
    op_counters: HashMap<&'static str, usize>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            inner: Mutex::new(GraphInner::default()),
        }
    }

    /// Appends a node with an auto-generated, scope-prefixed name.
    pub fn add(&self, op: Operation, inputs: Vec<Output>, spec: TensorSpec) -> NodeId {
        self.add_named(None, op, inputs, spec)
    }

    /// Appends a node, optionally overriding the base name. Names are made
    /// unique with a per-type counter and prefixed with the active scopes.
    pub fn add_named(
        &self,
        name: Option<&str>,
        op: Operation,
        inputs: Vec<Output>,
        spec: TensorSpec,
    ) -> NodeId {
        let mut inner = self.inner.lock().expect("graph poisoned");
        let id = NodeId(inner.nodes.len() as u32);
        let base = match name {
            Some(name) => name.to_string(),
            None => {
                let type_name = op.type_name();
                let counter = inner.op_counters.entry(type_name).or_insert(0);
                let base = if *counter == 0 {
                    type_name.to_string()
                } else {
                    format!("{type_name}_{counter}")
                };
                *counter += 1;
                base
            }
        };
        let full_name = if inner.scopes.is_empty() {
            base
        } else {
            format!("{}/{}", inner.scopes.join("/"), base)
        };
        inner.by_name.insert(full_name.clone(), id);
        inner.nodes.push(Node {
            id,
            name: full_name,
            op,
            inputs,
            spec,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("graph poisoned").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.inner
            .lock()
            .expect("graph poisoned")
            .nodes
            .get(id.0 as usize)
            .cloned()
    }

    /// Snapshot of every node in insertion (topological) order.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.lock().expect("graph poisoned").nodes.clone()
    }

    pub fn operation_by_name(&self, name: &str) -> Option<NodeId> {
        self.inner
            .lock()
            .expect("graph poisoned")
            .by_name
            .get(name)
            .copied()
    }

    /// Resolves a fetch string of the form `op` or `op:idx` to an output
    /// reference. A missing `:` suffix selects index 0; a non-integer suffix
    /// is a parse error.
    pub fn output_by_name(&self, fetch: &str) -> Result<Output, Error> {
        let (name, index) = parse_fetch(fetch)?;
        let node = self
            .operation_by_name(name)
            .ok_or_else(|| Error::bad_argument("fetch", format!("no operation named '{name}'")))?;
        Ok(Output { node, index })
    }

    /// Runs `f` with `name` pushed onto the scope stack; the scope is popped
    /// on every exit path, including panics.
    pub fn with_scope<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        let _guard = self.scoped(name);
        f()
    }

    /// Pushes a name scope and returns a guard that pops it on drop.
    pub fn scoped(&self, name: &str) -> ScopeGuard<'_> {
        self.inner
            .lock()
            .expect("graph poisoned")
            .scopes
            .push(name.to_string());
        ScopeGuard { graph: self }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

/// RAII guard that unwinds one level of the graph's scope stack.
pub struct ScopeGuard<'g> {
    graph: &'g Graph,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.graph
            .inner
            .lock()
            .expect("graph poisoned")
            .scopes
            .pop();
    }
}

fn parse_fetch(fetch: &str) -> Result<(&str, usize), Error> {
    match fetch.split_once(':') {
        None => Ok((fetch, 0)),
        Some((name, index)) => {
            let index = index.parse::<usize>().map_err(|_| Error::Parse {
                fetch: fetch.to_string(),
                message: format!("output index '{index}' is not an integer"),
            })?;
            Ok((name, index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{Dimension, Operation, TensorSpec};
    use crate::tensor::dtype::DType;

    fn scalar_spec() -> TensorSpec {
        TensorSpec::new(DType::F32, Vec::<Dimension>::new())
    }

    #[test]
    fn auto_names_are_unique_and_scoped() {
        let graph = Graph::new();
        let a = graph.add(Operation::Placeholder, vec![], scalar_spec());
        let b = graph.add(Operation::Placeholder, vec![], scalar_spec());
        assert_eq!(graph.node(a).unwrap().name, "Placeholder");
        assert_eq!(graph.node(b).unwrap().name, "Placeholder_1");

        let c = graph.with_scope("layer", || {
            graph.add(Operation::Placeholder, vec![], scalar_spec())
        });
        assert_eq!(graph.node(c).unwrap().name, "layer/Placeholder_2");
        assert_eq!(graph.operation_by_name("layer/Placeholder_2"), Some(c));
    }

    #[test]
    fn fetch_parsing_accepts_optional_index() {
        let graph = Graph::new();
        let a = graph.add_named(Some("logits"), Operation::Placeholder, vec![], scalar_spec());
        assert_eq!(graph.output_by_name("logits").unwrap(), Output::new(a));
        assert_eq!(
            graph.output_by_name("logits:1").unwrap(),
            Output { node: a, index: 1 }
        );
        assert!(matches!(
            graph.output_by_name("logits:one").unwrap_err(),
            Error::Parse { .. }
        ));
        assert!(graph.output_by_name("missing").is_err());
    }
}
