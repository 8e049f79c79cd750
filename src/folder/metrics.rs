use super::FolderStore;
use crate::error::Result;

impl FolderStore {
    /// Collect metrics from folder state and log them
    pub fn log_metrics(&self) -> Result<()> {
        let state = self.lock();

        let header_blocks = state.headers.len();
        let body_blocks = state.bodies.len();
        let messages = state.headers.total_count();
        let resident_blocks = state.cache.resident_count();
        let dirty_blocks = state.cache.dirty_count();
        let pending_loads = state.cache.pending_load_count();
        let (cache_hits, cache_misses) = state.cache.stats();

        let accuracy_ranges = state.accuracy.len();
        let open_slices = state.slices.len();
        let (mutex_holder, mutex_queued) = (state.mutex.holder(), state.mutex.queued());
        let slice_sizes: Vec<_> = state.slices.iter().map(|s| (s.id(), s.len())).collect();

        tracing::info!(
            folder = %self.folder_id(),
            messages,
            unread = state.unread_count,
            header_blocks,
            body_blocks,
            resident_blocks,
            dirty_blocks,
            pending_loads,
            cache_hits,
            cache_misses,
            accuracy_ranges,
            open_slices,
            purge_scheduled = state.purge_scheduled,
            ?mutex_holder,
            mutex_queued,
            ?slice_sizes,
            "Folder metrics"
        );

        Ok(())
    }
}
