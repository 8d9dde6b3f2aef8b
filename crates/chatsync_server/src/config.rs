//! Server configuration.

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of log entries returned by one difference slice.
    pub max_difference_slice: usize,
    /// Maximum number of messages returned by one page.
    pub max_page: u32,
    /// Maximum number of messages marked read by one read-history call.
    pub max_read_batch: usize,
    /// Maximum number of messages removed by one delete-history call.
    pub max_delete_batch: usize,
    /// Server date of the first logged event.
    pub start_date: i32,
}

impl ServerConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_difference_slice: 100,
            max_page: 100,
            max_read_batch: 100,
            max_delete_batch: 100,
            start_date: 1_000,
        }
    }

    /// Sets the difference slice size. Values below two are raised to two
    /// so every follow-up slice makes progress.
    pub fn with_max_difference_slice(mut self, size: usize) -> Self {
        self.max_difference_slice = size.max(2);
        self
    }

    /// Sets the maximum page size.
    pub fn with_max_page(mut self, size: u32) -> Self {
        self.max_page = size;
        self
    }

    /// Sets the read-history batch size.
    pub fn with_max_read_batch(mut self, size: usize) -> Self {
        self.max_read_batch = size.max(1);
        self
    }

    /// Sets the delete-history batch size.
    pub fn with_max_delete_batch(mut self, size: usize) -> Self {
        self.max_delete_batch = size.max(1);
        self
    }

    /// Sets the starting server date.
    pub fn with_start_date(mut self, date: i32) -> Self {
        self.start_date = date;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
