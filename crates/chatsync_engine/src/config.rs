//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for the update synchronizer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Silence on the update stream after which a reconciliation is forced.
    pub no_updates_timeout: Duration,
    /// Retry configuration for failed reconciliations.
    pub retry: RetryConfig,
    /// Paginated loader configuration.
    pub loader: LoaderConfig,
    /// Whether `read_history` sends read receipts to the server.
    pub read_history_enabled: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            no_updates_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            loader: LoaderConfig::default(),
            read_history_enabled: true,
        }
    }

    /// Sets the keep-alive timeout.
    pub fn with_no_updates_timeout(mut self, timeout: Duration) -> Self {
        self.no_updates_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Enables or disables server read receipts.
    pub fn with_read_history(mut self, enabled: bool) -> Self {
        self.read_history_enabled = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Page sizes and prefetch horizon of the sliding-window loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Page size while the window is still short.
    pub start_page: u32,
    /// Page size once more than `start_page` items are known.
    pub page: u32,
    /// Page size when the caller wants to skip ahead quickly.
    pub many_page: u32,
    /// Number of neighbours prefetched in the direction of travel.
    pub preload_count: u32,
    /// Focus span counted into the resident bound.
    pub resident_window: u32,
    /// Distance from a window edge at which a viewport change pages in more.
    pub edge_threshold: u32,
}

impl LoaderConfig {
    /// Sets the three page tiers.
    pub fn with_pages(mut self, start_page: u32, page: u32, many_page: u32) -> Self {
        self.start_page = start_page;
        self.page = page;
        self.many_page = many_page;
        self
    }

    /// Sets the prefetch horizon.
    pub fn with_preload_count(mut self, count: u32) -> Self {
        self.preload_count = count;
        self
    }

    /// Sets the focus span.
    pub fn with_resident_window(mut self, span: u32) -> Self {
        self.resident_window = span;
        self
    }

    /// Sets the edge threshold.
    pub fn with_edge_threshold(mut self, threshold: u32) -> Self {
        self.edge_threshold = threshold;
        self
    }

    /// Maximum number of full-resolution items resident in one window.
    pub fn max_resident(&self) -> usize {
        (self.resident_window + 2 * self.preload_count) as usize
    }

    /// Picks the page size for a window currently holding `known` items.
    pub fn page_size(&self, known: usize, many: bool) -> u32 {
        if many {
            self.many_page
        } else if known > self.start_page as usize {
            self.page
        } else {
            self.start_page
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            start_page: 20,
            page: 50,
            many_page: 100,
            preload_count: 4,
            resident_window: 1,
            edge_threshold: 20,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts; zero retries forever.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        // Reconciliation is retried until it succeeds or the session dies.
        Self::new(0)
    }
}
