//! Model selection for a run tree.
//!
//! The root run talks to the primary model; every delegated run talks to the
//! recursive model (which defaults to the primary). When a model keeps
//! failing, the dispatcher walks the fallback chain in order.

/// Which models a run may call, in order of preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub primary: String,
    /// Model for depth > 0. `None` means "same as primary".
    pub recursive: Option<String>,
    pub fallbacks: Vec<String>,
}

impl ModelRoute {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            recursive: None,
            fallbacks: Vec::new(),
        }
    }

    /// The model a run at `depth` dispatches to first.
    pub fn model_for_depth(&self, depth: u32) -> &str {
        match (&self.recursive, depth) {
            (Some(recursive), d) if d > 0 => recursive,
            _ => &self.primary,
        }
    }

    /// The full attempt order at `depth`: the depth's model followed by the
    /// fallback chain, with duplicates removed.
    pub fn chain_for_depth(&self, depth: u32) -> Vec<&str> {
        let mut chain = vec![self.model_for_depth(depth)];
        for model in &self.fallbacks {
            if !chain.contains(&model.as_str()) {
                chain.push(model);
            }
        }
        chain
    }
}

impl Default for ModelRoute {
    fn default() -> Self {
        ModelRoute::new(crate::DEFAULT_MODEL)
    }
}
