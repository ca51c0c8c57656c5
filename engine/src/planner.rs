//! Expands declarative prepare entries into a flat upload-task list.
//!
//! Each prepare entry names a set of images (with `{var}` template
//! placeholders), regex include/exclude filters, a destination, and an
//! optional modifier rule. When several entries produce the same image
//! name, the last entry wins for the parameter map while every matching
//! modifier rule still yields its own task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ferry_core::config::{MirrorConfig, PrepareEntry};
use ferry_core::error::{FerryError, Result};
use regex::Regex;

use crate::task::{Cleanup, UploadTask};

/// Planner output: tasks to run plus the per-image parameter map.
#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<UploadTask>,
    /// Image name → resolved substitution parameters (last entry wins).
    pub parameters: HashMap<String, HashMap<String, String>>,
}

/// Expands `MirrorConfig::prepare` into a [`Plan`].
pub struct UploadPlanner {
    config: Arc<MirrorConfig>,
}

impl UploadPlanner {
    pub fn new(config: Arc<MirrorConfig>) -> Self {
        Self { config }
    }

    pub fn plan(&self) -> Result<Plan> {
        let mut plan = Plan::default();
        // (image, destination) pairs that already have a plain copy task.
        let mut planned_copies: HashSet<(String, String)> = HashSet::new();

        for entry in &self.config.prepare {
            let includes = compile_patterns(&entry.includes)?;
            let excludes = compile_patterns(&entry.excludes)?;
            let destination = self.resolve_destination(entry)?;

            for image_template in &entry.images {
                let image_name = substitute(image_template, &entry.substitutions)?;
                if !passes_filters(&image_name, &includes, &excludes) {
                    continue;
                }

                plan.parameters
                    .insert(image_name.clone(), entry_parameters(entry));

                let Some(ref destination) = destination else {
                    continue;
                };

                if let Some(ref modifier) = entry.modifier {
                    if modifier_applies(entry) {
                        let append_tag = entry.modifier_append_tag.clone().ok_or_else(|| {
                            FerryError::Config(format!(
                                "Modifier {} on {} has no modifier_append_tag",
                                modifier, image_name
                            ))
                        })?;
                        plan.tasks.push(UploadTask {
                            image_name: image_name.clone(),
                            pull_source: entry.pull_source.clone(),
                            push_destination: destination.clone(),
                            append_tag: Some(append_tag),
                            modifier: Some(modifier.clone()),
                            modifier_vars: entry.modifier_vars.clone(),
                            modify_only_with_labels: entry.modify_only_with_labels.clone(),
                            cleanup: entry.cleanup,
                            multi_arch: entry.multi_arch || self.config.multi_arch,
                        });
                        planned_copies.insert((image_name.clone(), destination.clone()));
                        continue;
                    }
                }

                if planned_copies.insert((image_name.clone(), destination.clone())) {
                    plan.tasks.push(UploadTask {
                        image_name: image_name.clone(),
                        pull_source: entry.pull_source.clone(),
                        push_destination: destination.clone(),
                        append_tag: None,
                        modifier: None,
                        modifier_vars: HashMap::new(),
                        modify_only_with_labels: HashMap::new(),
                        cleanup: entry.cleanup,
                        multi_arch: entry.multi_arch || self.config.multi_arch,
                    });
                }
            }
        }

        tracing::debug!(
            tasks = plan.tasks.len(),
            images = plan.parameters.len(),
            "Expanded prepare entries"
        );
        Ok(plan)
    }

    /// Literal destination, the discovered local registry, or none
    /// (parameters-only entry).
    fn resolve_destination(&self, entry: &PrepareEntry) -> Result<Option<String>> {
        if let Some(ref host) = entry.push_destination {
            return Ok(Some(host.clone()));
        }
        if entry.discover_local {
            let host = self.config.local_registry.clone().ok_or_else(|| {
                FerryError::Config(
                    "Prepare entry discovers a local registry but local_registry is unset"
                        .to_string(),
                )
            })?;
            return Ok(Some(host));
        }
        Ok(None)
    }
}

/// A modifier rule's static source filter: when `modify_only_with_source`
/// is set, the entry's pull source must match. Label filters are carried on
/// the task and evaluated after the pull.
fn modifier_applies(entry: &PrepareEntry) -> bool {
    match entry.modify_only_with_source {
        Some(ref required) => entry.pull_source.as_deref() == Some(required.as_str()),
        None => true,
    }
}

/// Parameters recorded for one image from its (winning) entry.
fn entry_parameters(entry: &PrepareEntry) -> HashMap<String, String> {
    let mut parameters = entry.substitutions.clone();
    if let Some(ref label) = entry.tag_from_label {
        parameters.insert("tag_from_label".to_string(), label.clone());
    }
    parameters
}

/// Replace `{var}` placeholders; unresolved placeholders are fatal.
fn substitute(template: &str, substitutions: &HashMap<String, String>) -> Result<String> {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| FerryError::Config(format!("Invalid placeholder pattern: {}", e)))?;
    let mut missing = Vec::new();
    let substituted = placeholder
        .replace_all(template, |captures: &regex::Captures<'_>| {
            let key = &captures[1];
            match substitutions.get(key) {
                Some(value) => value.clone(),
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        })
        .into_owned();
    if let Some(key) = missing.first() {
        return Err(FerryError::Config(format!(
            "Image template '{}' references undefined variable '{}'",
            template, key
        )));
    }
    Ok(substituted)
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| FerryError::Config(format!("Invalid filter regex '{}': {}", pattern, e)))
        })
        .collect()
}

/// Included (or no includes configured) and not excluded.
fn passes_filters(image_name: &str, includes: &[Regex], excludes: &[Regex]) -> bool {
    let included = includes.is_empty() || includes.iter().any(|re| re.is_match(image_name));
    let excluded = excludes.iter().any(|re| re.is_match(image_name));
    included && !excluded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(entries: Vec<PrepareEntry>) -> Arc<MirrorConfig> {
        Arc::new(MirrorConfig {
            local_registry: Some("local-reg:8787".to_string()),
            prepare: entries,
            ..MirrorConfig::default()
        })
    }

    fn basic_entry(images: &[&str]) -> PrepareEntry {
        PrepareEntry {
            images: images.iter().map(|s| s.to_string()).collect(),
            push_destination: Some("local-reg:8787".to_string()),
            pull_source: Some("registry.example".to_string()),
            ..PrepareEntry::default()
        }
    }

    #[test]
    fn test_substitution() {
        let substitutions = HashMap::from([
            ("namespace".to_string(), "mirror".to_string()),
            ("tag".to_string(), "3.11".to_string()),
        ]);
        assert_eq!(
            substitute("{namespace}/base/python:{tag}", &substitutions).unwrap(),
            "mirror/base/python:3.11"
        );
        assert_eq!(substitute("plain/app:1", &substitutions).unwrap(), "plain/app:1");
        assert!(matches!(
            substitute("{unknown}/app", &substitutions),
            Err(FerryError::Config(_))
        ));
    }

    #[test]
    fn test_plan_expands_images() {
        let mut entry = basic_entry(&["{namespace}/app:1", "{namespace}/base/python:3.11"]);
        entry.substitutions.insert("namespace".to_string(), "mirror".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();

        assert_eq!(plan.tasks.len(), 2);
        assert!(plan.tasks.iter().all(|t| t.modifier.is_none()));
        assert!(plan
            .tasks
            .iter()
            .any(|t| t.image_name == "mirror/base/python:3.11"));
        assert_eq!(plan.tasks[0].push_destination, "local-reg:8787");
        assert_eq!(plan.tasks[0].pull_source.as_deref(), Some("registry.example"));
        assert_eq!(plan.parameters.len(), 2);
    }

    #[test]
    fn test_includes_and_excludes() {
        let mut entry = basic_entry(&["mirror/app:1", "mirror/nova-compute:2", "mirror/nova-api:2"]);
        entry.includes = vec!["^mirror/nova-".to_string()];
        entry.excludes = vec!["compute".to_string()];
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();

        let names: Vec<&str> = plan.tasks.iter().map(|t| t.image_name.as_str()).collect();
        assert_eq!(names, vec!["mirror/nova-api:2"]);
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.includes = vec!["(".to_string()];
        let planner = UploadPlanner::new(config_with(vec![entry]));
        assert!(matches!(planner.plan(), Err(FerryError::Config(_))));
    }

    #[test]
    fn test_discover_local_destination() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.push_destination = None;
        entry.discover_local = true;
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();
        assert_eq!(plan.tasks[0].push_destination, "local-reg:8787");
    }

    #[test]
    fn test_discover_local_without_registry_fails() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.push_destination = None;
        entry.discover_local = true;
        let config = Arc::new(MirrorConfig {
            prepare: vec![entry],
            ..MirrorConfig::default()
        });
        assert!(matches!(
            UploadPlanner::new(config).plan(),
            Err(FerryError::Config(_))
        ));
    }

    #[test]
    fn test_parameters_only_entry_produces_no_tasks() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.push_destination = None;
        entry.substitutions.insert("flavor".to_string(), "slim".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();
        assert!(plan.tasks.is_empty());
        assert_eq!(
            plan.parameters["mirror/app:1"].get("flavor").map(String::as_str),
            Some("slim")
        );
    }

    #[test]
    fn test_last_entry_wins_for_parameters() {
        let mut first = basic_entry(&["mirror/app:1"]);
        first.substitutions.insert("flavor".to_string(), "first".to_string());
        let mut second = basic_entry(&["mirror/app:1"]);
        second.substitutions.insert("flavor".to_string(), "second".to_string());
        let planner = UploadPlanner::new(config_with(vec![first, second]));
        let plan = planner.plan().unwrap();

        assert_eq!(
            plan.parameters["mirror/app:1"].get("flavor").map(String::as_str),
            Some("second")
        );
        // The plain copy is planned once, not per entry.
        assert_eq!(plan.tasks.len(), 1);
    }

    #[test]
    fn test_modifier_rules_all_execute() {
        let mut first = basic_entry(&["mirror/app:1"]);
        first.modifier = Some("add-foo".to_string());
        first.modifier_append_tag = Some("-mod1".to_string());
        first.modifier_vars.insert("foo_version".to_string(), "1.0.1".to_string());
        let mut second = basic_entry(&["mirror/app:1"]);
        second.modifier = Some("add-bar".to_string());
        second.modifier_append_tag = Some("-mod2".to_string());

        let planner = UploadPlanner::new(config_with(vec![first, second]));
        let plan = planner.plan().unwrap();

        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].modifier.as_deref(), Some("add-foo"));
        assert_eq!(plan.tasks[0].append_tag.as_deref(), Some("-mod1"));
        assert_eq!(
            plan.tasks[0].modifier_vars.get("foo_version").map(String::as_str),
            Some("1.0.1")
        );
        assert_eq!(plan.tasks[1].modifier.as_deref(), Some("add-bar"));
    }

    #[test]
    fn test_modifier_without_append_tag_fails() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.modifier = Some("add-foo".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        assert!(matches!(planner.plan(), Err(FerryError::Config(_))));
    }

    #[test]
    fn test_modify_only_with_source_gates_modifier() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.modifier = Some("add-foo".to_string());
        entry.modifier_append_tag = Some("-mod1".to_string());
        entry.modify_only_with_source = Some("other.example".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();

        // Source does not match: the image is still copied, not modified.
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.tasks[0].modifier.is_none());
    }

    #[test]
    fn test_cleanup_policy_propagates() {
        let mut entry = basic_entry(&["mirror/app:1"]);
        entry.cleanup = Cleanup::Full;
        entry.modifier = Some("add-foo".to_string());
        entry.modifier_append_tag = Some("-mod1".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();
        assert_eq!(plan.tasks[0].cleanup, Cleanup::Full);

        let mut plain = basic_entry(&["mirror/other:1"]);
        plain.cleanup = Cleanup::Partial;
        let plan = UploadPlanner::new(config_with(vec![plain])).plan().unwrap();
        assert_eq!(plan.tasks[0].cleanup, Cleanup::Partial);
    }

    #[test]
    fn test_tag_from_label_recorded() {
        let mut entry = basic_entry(&["mirror/app"]);
        entry.tag_from_label = Some("release".to_string());
        let planner = UploadPlanner::new(config_with(vec![entry]));
        let plan = planner.plan().unwrap();
        assert_eq!(
            plan.parameters["mirror/app"].get("tag_from_label").map(String::as_str),
            Some("release")
        );
    }
}
