use anyhow::{Context, Result};
use backlog_core::filter::{CompiledFilter, FilterCompiler, FilterContext, FilterSet, Predicate};
use backlog_core::tree::TreeIndex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reorder::{DragReorderCoordinator, RefetchRequest};
use crate::store::{ItemSource, ScopeFilter};

/// What a loaded backlog view shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogQuery {
    /// Part of the backlog to load.
    pub scope: ScopeFilter,
    /// Named filters.
    pub filters: FilterSet,
    /// Caller identity for personalized filters.
    pub context: FilterContext,
}

/// Service façade: compile filters, retrieve items, build trees, and apply re-fetches.
pub struct BacklogService<R> {
    source: R,
    compiler: FilterCompiler,
}

impl<R> BacklogService<R> {
    /// Service reading from `source` with the default search fields.
    #[must_use]
    pub fn new(source: R) -> Self {
        Self {
            source,
            compiler: FilterCompiler::new(),
        }
    }

    /// Retrieval collaborator.
    #[must_use]
    pub const fn source(&self) -> &R {
        &self.source
    }

    /// Compile the query's filters, logging any filter skipped for missing context.
    ///
    /// # Errors
    /// Returns an error if a filter value cannot be interpreted.
    pub fn compile(&self, query: &BacklogQuery) -> Result<CompiledFilter> {
        let compiled = self
            .compiler
            .compile(&query.filters, &query.context)
            .context("failed to compile backlog filters")?;
        for (name, reason) in &compiled.skipped {
            debug!(filter = %name, ?reason, "Filter left unconstrained");
        }
        Ok(compiled)
    }

    /// Filtered view of `tree`, e.g. the coordinator's full tree, for rendering.
    ///
    /// # Errors
    /// Returns an error if the query's filters do not compile.
    pub fn view(&self, query: &BacklogQuery, tree: &TreeIndex) -> Result<TreeIndex> {
        let compiled = self.compile(query)?;
        Ok(TreeIndex::build(
            tree.flatten()
                .into_iter()
                .filter(|node| query.scope.admits(node.item) && compiled.predicate.matches(node.item))
                .map(|node| node.item.clone()),
        ))
    }
}

impl<R: ItemSource> BacklogService<R> {
    /// Load the items matching `query` and materialize them as a tree.
    ///
    /// # Errors
    /// Returns an error if filters do not compile or retrieval fails.
    pub async fn load(&self, query: &BacklogQuery) -> Result<TreeIndex> {
        let compiled = self.compile(query)?;
        let items = self
            .source
            .list_items(&query.scope, &compiled.predicate)
            .await
            .context("failed to list backlog items")?;
        let tree = TreeIndex::build(items);
        if !tree.rebalance_candidates().is_empty() {
            warn!(
                scopes = tree.rebalance_candidates().len(),
                "Loaded backlog holds duplicate ranks"
            );
        }
        info!(items = tree.len(), "Loaded backlog");
        Ok(tree)
    }

    /// Load every item inside `query.scope`, ignoring its filters.
    ///
    /// A [`DragReorderCoordinator`] must be seeded with this tree: ranks are
    /// chosen between stored neighbors, and a filtered tree hides some of them.
    ///
    /// # Errors
    /// Returns an error if retrieval fails.
    pub async fn load_scope(&self, query: &BacklogQuery) -> Result<TreeIndex> {
        let items = self
            .source
            .list_items(&query.scope, &Predicate::default())
            .await
            .context("failed to list backlog scope")?;
        let tree = TreeIndex::build(items);
        debug!(items = tree.len(), "Loaded backlog scope for reordering");
        Ok(tree)
    }

    /// Reload the coordinator's tree after a rolled-back reorder.
    ///
    /// # Errors
    /// Returns an error if the reload fails; the coordinator keeps its tree then.
    pub async fn handle_refetch<S>(
        &self,
        query: &BacklogQuery,
        coordinator: &DragReorderCoordinator<S>,
        request: &RefetchRequest,
    ) -> Result<()> {
        info!(item = %request.item, scopes = request.scopes.len(), reason = %request.reason, "Re-fetching backlog");
        let tree = self.load_scope(query).await?;
        coordinator.reload(tree).await;
        Ok(())
    }

    /// Serve every re-fetch request already queued, returning how many were handled.
    ///
    /// # Errors
    /// Stops at the first reload failure.
    pub async fn drain_refetches<S>(
        &self,
        query: &BacklogQuery,
        coordinator: &DragReorderCoordinator<S>,
        requests: &mut mpsc::UnboundedReceiver<RefetchRequest>,
    ) -> Result<usize> {
        let mut handled = 0;
        while let Ok(request) = requests.try_recv() {
            self.handle_refetch(query, coordinator, &request).await?;
            handled += 1;
        }
        Ok(handled)
    }
}
