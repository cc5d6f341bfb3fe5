/// Size guard applied to documents entering a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_nodes: usize,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self { Self { max_nodes: 100_000, max_depth: 64 } }
}

impl Limits {
    /// Defaults overridden by `REFMAP_MAX_DOC_NODES` and `REFMAP_MAX_DOC_DEPTH`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_nodes = std::env::var("REFMAP_MAX_DOC_NODES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.max_nodes);
        let max_depth = std::env::var("REFMAP_MAX_DOC_DEPTH")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.max_depth);
        Self { max_nodes, max_depth }
    }
}
