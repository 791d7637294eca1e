// SPDX-License-Identifier: MIT

//! `StepRegistry`: discovers and instantiates steps by name, validating
//! the declared-dependency graph once at construction time, before
//! accepting a new pipeline definition.

use crate::step::{StepFactory, StepParams};
use codestory_core::CoreError;
use std::collections::{HashMap, HashSet};

pub struct StepRegistry {
    factories: HashMap<String, Box<dyn StepFactory>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn crate::step::Step>> {
        self.factories.get(name).map(|f| f.create())
    }

    pub fn known_names(&self) -> HashSet<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Validate a requested step set against this registry: every name is
    /// known, no step depends on itself, and the induced subgraph is
    /// acyclic.
    pub fn validate(
        &self,
        requested: &[(String, StepParams)],
    ) -> Result<HashMap<String, HashSet<String>>, CoreError> {
        let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
        let requested_names: HashSet<&str> = requested.iter().map(|(n, _)| n.as_str()).collect();

        for (name, params) in requested {
            let factory_name = self
                .factories
                .get(name)
                .ok_or_else(|| CoreError::InvalidPipeline(format!("unknown step: {name}")))?;
            let step = factory_name.create();
            let declared = step.declared_dependencies(params);

            for dep in &declared {
                if dep == name {
                    return Err(CoreError::InvalidPipeline(format!(
                        "step '{name}' declares a dependency on itself"
                    )));
                }
                if !requested_names.contains(dep.as_str()) {
                    return Err(CoreError::InvalidPipeline(format!(
                        "step '{name}' depends on '{dep}', which was not requested for this job"
                    )));
                }
            }
            deps.insert(name.clone(), declared);
        }

        detect_cycle(&deps)?;
        Ok(deps)
    }
}

/// Kahn's algorithm cycle check: if topological processing cannot consume
/// every node, a cycle exists among the remainder.
// Allow unwrap here: `candidate` is only pushed into `ready` because it
// appears as a key of `deps`, and `unresolved` is built from the same keys.
#[allow(clippy::unwrap_used)]
fn detect_cycle(deps: &HashMap<String, HashSet<String>>) -> Result<(), CoreError> {
    // Unresolved-dependency count per step; a step becomes "ready" for
    // processing once it reaches zero.
    let mut unresolved: HashMap<&str, usize> =
        deps.iter().map(|(k, v)| (k.as_str(), v.len())).collect();

    let mut ready: Vec<&str> = unresolved
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort_unstable();

    let mut processed = HashSet::new();
    while let Some(name) = ready.pop() {
        processed.insert(name);
        for (candidate, candidate_deps) in deps {
            if processed.contains(candidate.as_str()) {
                continue;
            }
            if candidate_deps.iter().any(|d| d == name) {
                let count = unresolved.get_mut(candidate.as_str()).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.push(candidate.as_str());
                }
            }
        }
    }

    if processed.len() != deps.len() {
        let cycle: Vec<&str> = deps
            .keys()
            .map(String::as_str)
            .filter(|n| !processed.contains(n))
            .collect();
        return Err(CoreError::InvalidPipeline(format!(
            "dependency cycle detected among steps: {}",
            cycle.join(", ")
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct StepRegistryBuilder {
    factories: HashMap<String, Box<dyn StepFactory>>,
}

impl StepRegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, factory: impl StepFactory + 'static) -> Self {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            factories: self.factories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Step, StepContext, StepOutcome};
    use async_trait::async_trait;

    struct StubStep {
        name: &'static str,
        deps: Vec<&'static str>,
    }

    #[async_trait]
    impl Step for StubStep {
        fn name(&self) -> &str {
            self.name
        }

        fn declared_dependencies(&self, _params: &StepParams) -> HashSet<String> {
            self.deps.iter().map(|s| s.to_string()).collect()
        }

        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            StepOutcome::Succeeded
        }
    }

    fn registry() -> StepRegistry {
        StepRegistry::builder()
            .register("filesystem", || {
                Box::new(StubStep { name: "filesystem", deps: vec![] }) as Box<dyn Step>
            })
            .register("ast", || {
                Box::new(StubStep { name: "ast", deps: vec!["filesystem"] }) as Box<dyn Step>
            })
            .register("summarizer", || {
                Box::new(StubStep { name: "summarizer", deps: vec!["filesystem", "ast"] })
                    as Box<dyn Step>
            })
            .register("docgrapher", || {
                Box::new(StubStep { name: "docgrapher", deps: vec!["filesystem"] }) as Box<dyn Step>
            })
            .build()
    }

    fn requested(names: &[&str]) -> Vec<(String, StepParams)> {
        names.iter().map(|n| (n.to_string(), StepParams::new())).collect()
    }

    #[test]
    fn validate_accepts_an_acyclic_dag() {
        let registry = registry();
        let deps = registry
            .validate(&requested(&["filesystem", "ast", "summarizer", "docgrapher"]))
            .unwrap();
        assert_eq!(deps.len(), 4);
    }

    #[test]
    fn validate_rejects_unknown_step_names() {
        let registry = registry();
        let err = registry.validate(&requested(&["not-a-step"])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPipeline(_)));
    }

    #[test]
    fn validate_rejects_a_cycle() {
        struct A;
        struct B;
        #[async_trait]
        impl Step for A {
            fn name(&self) -> &str { "a" }
            fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
                ["b".to_string()].into_iter().collect()
            }
            async fn run(&self, _ctx: StepContext) -> StepOutcome { StepOutcome::Succeeded }
        }
        #[async_trait]
        impl Step for B {
            fn name(&self) -> &str { "b" }
            fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
                ["a".to_string()].into_iter().collect()
            }
            async fn run(&self, _ctx: StepContext) -> StepOutcome { StepOutcome::Succeeded }
        }
        let registry = StepRegistry::builder()
            .register("a", || Box::new(A) as Box<dyn Step>)
            .register("b", || Box::new(B) as Box<dyn Step>)
            .build();
        let err = registry.validate(&requested(&["a", "b"])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPipeline(_)));
    }

    #[test]
    fn validate_rejects_self_dependency() {
        struct SelfDep;
        #[async_trait]
        impl Step for SelfDep {
            fn name(&self) -> &str { "loopy" }
            fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
                ["loopy".to_string()].into_iter().collect()
            }
            async fn run(&self, _ctx: StepContext) -> StepOutcome { StepOutcome::Succeeded }
        }
        let registry = StepRegistry::builder()
            .register("loopy", || Box::new(SelfDep) as Box<dyn Step>)
            .build();
        let err = registry.validate(&requested(&["loopy"])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPipeline(_)));
    }
}
