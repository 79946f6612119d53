//! Adaptive chunk sizing
//!
//! A chunk is the number of API pages pulled between two checkpoint writes.
//! Small chunks lose less work on a crash, large chunks hit the checkpoint
//! store less often. The controller re-derives the size after every chunk
//! from what that chunk cost: clean and fast grows it, errors or slowness
//! shrink it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Chunk sizing tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Smallest chunk, in pages
    #[serde(default = "default_min_pages", alias = "chunk_size_min")]
    pub min_pages: u32,

    /// Largest chunk, in pages
    #[serde(default = "default_max_pages", alias = "chunk_size_max")]
    pub max_pages: u32,

    /// Chunks slower than this shrink the next one
    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: f64,

    /// Multiplier applied after a clean, fast chunk
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Multiplier applied after an error or a slow chunk
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_pages: default_min_pages(),
            max_pages: default_max_pages(),
            target_duration_secs: default_target_duration_secs(),
            growth_factor: default_growth_factor(),
            shrink_factor: default_shrink_factor(),
        }
    }
}

fn default_min_pages() -> u32 {
    2
}

fn default_max_pages() -> u32 {
    20
}

fn default_target_duration_secs() -> f64 {
    30.0
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_shrink_factor() -> f64 {
    0.5
}

impl ChunkConfig {
    /// Fixed chunk size
    pub fn fixed(pages: u32) -> Self {
        Self {
            min_pages: pages,
            max_pages: pages,
            ..Self::default()
        }
    }

    /// Set the page bounds
    #[must_use]
    pub fn with_bounds(mut self, min_pages: u32, max_pages: u32) -> Self {
        self.min_pages = min_pages;
        self.max_pages = max_pages;
        self
    }

    /// Lower bound with a floor of one page
    fn floor(&self) -> u32 {
        self.min_pages.max(1)
    }

    /// Upper bound, never below the lower one
    fn ceiling(&self) -> u32 {
        self.max_pages.max(self.floor())
    }
}

/// AIMD-style chunk size controller
#[derive(Debug, Clone)]
pub struct ChunkController {
    config: ChunkConfig,
    current: u32,
}

impl ChunkController {
    /// Create a controller starting at the minimum size
    pub fn new(config: ChunkConfig) -> Self {
        let current = config.floor();
        Self { config, current }
    }

    /// Size the controller will hand out next, without observing anything
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Get the configuration
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Observe the previous chunk and return the size of the next one.
    ///
    /// The result is always within `[min_pages, max_pages]`.
    pub fn next_chunk_size(
        &mut self,
        previous_duration: Duration,
        previous_row_count: u64,
        previous_error_count: u32,
    ) -> u32 {
        let (floor, ceiling) = (self.config.floor(), self.config.ceiling());
        if floor == ceiling {
            self.current = floor;
            return floor;
        }

        let slow = previous_duration.as_secs_f64() > self.config.target_duration_secs;
        let factor = if previous_error_count > 0 || slow {
            self.config.shrink_factor
        } else if previous_row_count == 0 {
            // an empty chunk says nothing about cost
            1.0
        } else {
            self.config.growth_factor
        };

        let scaled = (f64::from(self.current) * factor).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut next = if scaled.is_finite() && scaled > 0.0 {
            scaled.min(f64::from(u32::MAX)) as u32
        } else {
            floor
        };

        // a growth factor close to 1.0 must still make progress
        if factor > 1.0 && next == self.current {
            next = next.saturating_add(1);
        }
        if factor < 1.0 && next == self.current {
            next = next.saturating_sub(1);
        }

        let next = next.clamp(floor, ceiling);
        debug!(
            previous = self.current,
            next,
            errors = previous_error_count,
            rows = previous_row_count,
            duration_ms = u64::try_from(previous_duration.as_millis()).unwrap_or(u64::MAX),
            "Chunk size adjusted"
        );
        self.current = next;
        next
    }
}
