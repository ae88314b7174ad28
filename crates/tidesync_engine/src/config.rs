//! Configuration for a sync context.

/// Tunables for a [`crate::SyncContext`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows requested per pull page.
    pub page_size: usize,
    /// Worker threads in the callback executor.
    pub callback_workers: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pull page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the callback executor's worker count.
    #[must_use]
    pub fn with_callback_workers(mut self, workers: usize) -> Self {
        self.callback_workers = workers.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            callback_workers: 4,
        }
    }
}
