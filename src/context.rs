use std::future::Future;

/// Identity of the run a task works for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunContext {
    pub run_id: String,
    pub graph_id: String,
    pub node_id: Option<String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, graph_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            node_id: None,
        }
    }

    pub fn for_node(&self, node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..self.clone()
        }
    }

    /// Thread or log label, e.g. `run-1:WRITER`
    pub fn label(&self) -> String {
        match &self.node_id {
            Some(node) => format!("{}:{}", self.run_id, node),
            None => format!("{}:watchdog", self.run_id),
        }
    }
}

tokio::task_local! {
    static RUN_CONTEXT: RunContext;
}

/// Access to the run context installed around watchdog and node tasks
pub struct ContextProvider;

impl ContextProvider {
    /// Context of the calling task, if it runs inside a scope
    pub fn current() -> Option<RunContext> {
        RUN_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    pub fn run_id() -> Option<String> {
        RUN_CONTEXT.try_with(|ctx| ctx.run_id.clone()).ok()
    }

    /// Run `future` with `context` installed; the context is gone once it completes
    pub async fn scope<F: Future>(context: RunContext, future: F) -> F::Output {
        RUN_CONTEXT.scope(context, future).await
    }
}
