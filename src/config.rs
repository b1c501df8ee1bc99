use serde::{Deserialize, Serialize};

/// Scale base used when none is given.
pub const DEFAULT_BASE: f64 = 1.3;

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Geometric ratio between consecutive level radii; must exceed 1.
    pub base: f64,
    /// Upper bound on worker threads.
    pub parallelism: usize,
}

impl BuildParams {
    pub fn new(base: f64, parallelism: usize) -> Self {
        Self { base, parallelism }
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            parallelism: default_parallelism(),
        }
    }
}

/// Batch query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Neighbours returned per query.
    pub k: usize,
    /// Upper bound on worker threads.
    pub parallelism: usize,
}

impl QueryParams {
    pub fn new(k: usize, parallelism: usize) -> Self {
        Self { k, parallelism }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            k: 1,
            parallelism: default_parallelism(),
        }
    }
}
