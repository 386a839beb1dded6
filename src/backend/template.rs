//! Submission script rendering using Handlebars.

use std::collections::HashMap;
use std::path::Path;

use handlebars::Handlebars;

use crate::error::{JobControlError, Result};

/// Values every submission script is rendered with.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub name: &'a str,
    pub nodes: u32,
    pub ncpus: u32,
    pub walltime: &'a str,
    pub executor: &'a Path,
    pub root: &'a Path,
    pub manifest: &'a Path,
}

impl ScriptContext<'_> {
    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("name".to_string(), self.name.to_string());
        map.insert("nodes".to_string(), self.nodes.to_string());
        map.insert("ncpus".to_string(), self.ncpus.to_string());
        map.insert("walltime".to_string(), self.walltime.to_string());
        map.insert("executor".to_string(), self.executor.display().to_string());
        map.insert("root".to_string(), self.root.display().to_string());
        map.insert("manifest".to_string(), self.manifest.display().to_string());
        map
    }
}

/// Renders backend templates into runnable scripts
pub struct ScriptRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for ScriptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // Shell scripts, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render `template` with the script context plus backend-specific extras.
    pub fn render(
        &self,
        backend: &str,
        template: &str,
        context: &ScriptContext<'_>,
        extra: &[(&str, String)],
    ) -> Result<String> {
        let mut values = context.to_map();
        for (key, value) in extra {
            values.insert((*key).to_string(), value.clone());
        }
        self.handlebars
            .render_template(template, &values)
            .map_err(|e| JobControlError::scheduler(backend, format!("Failed to render submission script: {}", e)))
    }
}
