//! Skill registry: name -> skill, populated at startup.
//!
//! The registry is immutable once built; introducing a new skill requires a
//! restart.

use std::collections::HashMap;
use std::sync::Arc;

use crate::skills::{Skill, SkillDescriptor};

pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
        }
    }

    /// Register a skill. Startup-time only.
    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        let name = skill.descriptor().name.to_string();
        tracing::debug!("registered skill: {}", name);
        self.skills.insert(name, skill);
    }

    /// Get a skill by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    /// List all skill names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.skills.len()
    }

    /// Descriptors for prompt construction, sorted by name.
    pub fn descriptors(&self) -> Vec<SkillDescriptor> {
        let mut out: Vec<SkillDescriptor> = self
            .skills
            .values()
            .map(|s| s.descriptor().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(b.name));
        out
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::builtin::TimeSkill;

    #[test]
    fn register_and_get() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(TimeSkill::new()));

        assert!(registry.has("time"));
        assert!(registry.get("time").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn list_skills() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(TimeSkill::new()));

        let names = registry.list();
        assert!(names.contains(&"time".to_string()));
    }

    #[test]
    fn descriptors_are_sorted() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(TimeSkill::new()));

        let defs = registry.descriptors();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "time");
    }
}
