// Step template registry
//
// Maps a workflow type to its ordered list of step names. Persisted executions
// capture the list at creation time, but the registry must still stay stable:
// the same workflow type always yields the same steps.

use std::collections::BTreeMap;

use crate::error::RegistryError;

/// Well-known step names
pub mod step_names {
    pub const PREVIEW_DEPLOYMENT: &str = "preview_deployment";
    pub const AUTONOMOUS_TESTING_LOOP: &str = "autonomous_testing_loop";
}

/// Built-in workflow types
pub mod workflow_types {
    pub const FULL_PIPELINE: &str = "full-pipeline";
    pub const PREVIEW_ONLY: &str = "preview-only";
    pub const TESTING_ONLY: &str = "testing-only";
}

/// Registry of workflow type -> ordered step names
#[derive(Debug, Clone, Default)]
pub struct StepTemplateRegistry {
    templates: BTreeMap<String, Vec<String>>,
}

impl StepTemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in templates
    pub fn builtin() -> Self {
        use step_names::*;
        use workflow_types::*;

        Self::new()
            .with_template(FULL_PIPELINE, [PREVIEW_DEPLOYMENT, AUTONOMOUS_TESTING_LOOP])
            .with_template(PREVIEW_ONLY, [PREVIEW_DEPLOYMENT])
            .with_template(TESTING_ONLY, [AUTONOMOUS_TESTING_LOOP])
    }

    /// Add or replace a template
    pub fn with_template<I, S>(mut self, workflow_type: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.templates.insert(
            workflow_type.into(),
            steps.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Ordered step names for a workflow type
    pub fn template_for(&self, workflow_type: &str) -> Result<&[String], RegistryError> {
        self.templates
            .get(workflow_type)
            .map(Vec::as_slice)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// All registered workflow types, sorted
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Every distinct step name used by any template
    pub fn all_step_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .templates
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_pipeline_template() {
        let registry = StepTemplateRegistry::builtin();
        let steps = registry.template_for("full-pipeline").unwrap();
        assert_eq!(steps, ["preview_deployment", "autonomous_testing_loop"]);
    }

    #[test]
    fn test_lookup_is_stable() {
        let registry = StepTemplateRegistry::builtin();
        for workflow_type in registry.workflow_types() {
            let first = registry.template_for(workflow_type).unwrap().to_vec();
            let second = registry.template_for(workflow_type).unwrap().to_vec();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = StepTemplateRegistry::builtin();
        assert_eq!(
            registry.template_for("nightly"),
            Err(RegistryError::UnknownWorkflowType("nightly".to_string()))
        );
    }

    #[test]
    fn test_all_step_names_deduplicated() {
        let registry = StepTemplateRegistry::builtin();
        assert_eq!(
            registry.all_step_names(),
            vec!["autonomous_testing_loop", "preview_deployment"]
        );
    }
}
