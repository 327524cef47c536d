//! Compiled template cache keyed by source text

use crate::error::TemplateResult;
use crate::Template;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Cache of compiled templates
///
/// Each distinct template text is compiled once and shared by every rule
/// that uses it. Compilation failures are not cached.
#[derive(Debug, Clone, Default)]
pub struct TemplateCache {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a compiled template, compiling and caching it on a miss
    pub fn get_or_compile(&mut self, source: &str) -> TemplateResult<Arc<Template>> {
        if let Some(template) = self.templates.get(source) {
            return Ok(Arc::clone(template));
        }

        trace!(template = source, "Compiling template");
        let template = Arc::new(Template::compile(source)?);
        self.templates
            .insert(source.to_string(), Arc::clone(&template));
        Ok(template)
    }

    pub fn get(&self, source: &str) -> Option<Arc<Template>> {
        self.templates.get(source).cloned()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.templates.contains_key(source)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn clear(&mut self) {
        self.templates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiles_once() {
        let mut cache = TemplateCache::new();
        let first = cache.get_or_compile("{{ a }}").unwrap();
        let second = cache.get_or_compile("{{ a }}").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failures_not_cached() {
        let mut cache = TemplateCache::new();
        assert!(cache.get_or_compile("{{ a +").is_err());
        assert!(cache.is_empty());
    }
}
