//! Request classification for picking a caching strategy

use crate::config::ClassificationRules;
use crate::models::{InterceptedRequest, ResourceCategory};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Maps an intercepted request to exactly one [`ResourceCategory`]
///
/// The rules are configuration data and can be swapped at runtime with
/// [`ResourceClassifier::update_rules`].
pub struct ResourceClassifier {
    rules: RwLock<Arc<ClassificationRules>>,
}

impl ResourceClassifier {
    /// Create a new ResourceClassifier with the given rules
    pub fn new(rules: ClassificationRules) -> Self {
        ResourceClassifier {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Replace the classification rules
    pub fn update_rules(&self, rules: ClassificationRules) {
        match self.rules.write() {
            Ok(mut current) => *current = Arc::new(rules),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(rules),
        }
    }

    /// Current classification rules
    pub fn rules(&self) -> Arc<ClassificationRules> {
        match self.rules.read() {
            Ok(rules) => Arc::clone(&rules),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Classify a request
    ///
    /// # Logic
    /// Checked in order, first match wins:
    /// 1. Path starts with the API prefix → `Api`
    /// 2. Path ends with a static extension, starts with a static prefix, or the
    ///    host contains a CDN pattern → `Static`
    /// 3. Accept header includes `text/html` → `HtmlNavigation`
    /// 4. Otherwise → `Other`
    pub fn classify(&self, request: &InterceptedRequest) -> ResourceCategory {
        let rules = self.rules();
        let path = request.path();

        let category = if path.starts_with(&rules.api_prefix) {
            ResourceCategory::Api
        } else if Self::is_static(&rules, request) {
            ResourceCategory::Static
        } else if request.accepts_html() {
            ResourceCategory::HtmlNavigation
        } else {
            ResourceCategory::Other
        };

        debug!("Classified request: url={}, category={}", request.url, category.as_str());
        category
    }

    fn is_static(rules: &ClassificationRules, request: &InterceptedRequest) -> bool {
        let path = request.path();
        if rules.static_extensions.iter().any(|ext| path.ends_with(ext.as_str())) {
            return true;
        }
        if rules.static_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return true;
        }
        let host = request.url.host_str().unwrap_or("");
        rules
            .cdn_host_patterns
            .iter()
            .any(|pattern| host.contains(pattern.as_str()))
    }
}

impl Default for ResourceClassifier {
    fn default() -> Self {
        Self::new(ClassificationRules::default())
    }
}
