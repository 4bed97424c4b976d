//! Ordered release of connection resources.

use async_trait::async_trait;
use tracing::Span;

use crate::{Error, Result};

/// A resource layer that must be released exactly once.
#[async_trait]
pub trait Release: Send {
    async fn release(&mut self) -> Result<()>;
}

struct Layer {
    name: String,
    resource: Box<dyn Release>,
}

/// Stack of acquired resources, released in reverse order of acquisition.
///
/// Each layer is popped before it is released, so a layer is never released
/// twice and repeated teardowns are no-ops.
pub struct ResourceStack {
    layers: Vec<Layer>,
    span: Span,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register a freshly acquired layer on top of the stack.
    pub fn register(&mut self, name: impl Into<String>, resource: impl Release + 'static) {
        let name = name.into();
        tracing::trace!(parent: &self.span, layer = %name, "registered");
        self.layers.push(Layer {
            name,
            resource: Box::new(resource),
        });
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Release every registered layer, newest first.
    ///
    /// A failing layer does not stop the layers beneath it from being
    /// released; all failures are reported together.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(mut layer) = self.layers.pop() {
            match layer.resource.release().await {
                Ok(()) => tracing::debug!(parent: &self.span, layer = %layer.name, "released"),
                Err(e) => {
                    tracing::warn!(parent: &self.span, layer = %layer.name, error = %e, "release failed");
                    failures.push(format!("{}: {e}", layer.name));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown { failures })
        }
    }
}

impl Default for ResourceStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.layers.is_empty() {
            tracing::warn!(
                parent: &self.span,
                layers = self.layers.len(),
                "resources dropped without teardown"
            );
        }
    }
}
