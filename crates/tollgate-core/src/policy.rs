use std::collections::HashMap;

use tollgate_common::{RouteTarget, RoutingSettings};
use tollgate_provider_core::{ModelName, ProviderCandidate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("no route for model {0}")]
    NoRoute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    provider: String,
    rank: u32,
    model: Option<String>,
}

/// Static provider preferences: per-model overrides first, then per namespace.
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    namespaces: HashMap<String, Vec<Target>>,
    models: HashMap<String, Vec<Target>>,
}

impl RoutingPolicy {
    pub fn from_settings(settings: &RoutingSettings) -> Self {
        Self {
            namespaces: settings
                .namespaces
                .iter()
                .map(|(key, targets)| (key.clone(), ordered(targets)))
                .collect(),
            models: settings
                .models
                .iter()
                .map(|(key, targets)| (key.clone(), ordered(targets)))
                .collect(),
        }
    }

    /// Ordered candidates for `model`. Deterministic: rank, then declaration order.
    pub fn candidates(&self, model: &ModelName) -> Result<Vec<ProviderCandidate>, PolicyError> {
        let full = model.to_string();
        let targets = self
            .models
            .get(&full)
            .or_else(|| self.namespaces.get(model.namespace()))
            .ok_or_else(|| PolicyError::NoRoute(full.clone()))?;
        Ok(targets
            .iter()
            .map(|target| ProviderCandidate {
                provider: target.provider.clone(),
                model: target.model.clone().unwrap_or_else(|| full.clone()),
                rank: target.rank,
            })
            .collect())
    }
}

fn ordered(targets: &[RouteTarget]) -> Vec<Target> {
    let mut out: Vec<Target> = targets
        .iter()
        .enumerate()
        .map(|(index, target)| Target {
            provider: target.provider().to_string(),
            rank: target.priority().unwrap_or(index as u32),
            model: target.model().map(str::to_string),
        })
        .collect();
    // sort_by_key is stable, so equal ranks keep declaration order.
    out.sort_by_key(|target| target.rank);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings() -> RoutingSettings {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(
            "acme".to_string(),
            vec![
                RouteTarget::Name("p1".to_string()),
                RouteTarget::Name("p2".to_string()),
                RouteTarget::Name("p3".to_string()),
            ],
        );
        namespaces.insert(
            "tied".to_string(),
            vec![
                RouteTarget::Detailed {
                    provider: "b".to_string(),
                    priority: Some(5),
                    model: None,
                },
                RouteTarget::Detailed {
                    provider: "a".to_string(),
                    priority: Some(5),
                    model: None,
                },
                RouteTarget::Detailed {
                    provider: "c".to_string(),
                    priority: Some(1),
                    model: None,
                },
            ],
        );
        let mut models = BTreeMap::new();
        models.insert(
            "acme/special".to_string(),
            vec![RouteTarget::Detailed {
                provider: "p3".to_string(),
                priority: None,
                model: Some("acme/special-v2".to_string()),
            }],
        );
        RoutingSettings { namespaces, models }
    }

    fn providers(candidates: &[ProviderCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.provider.as_str()).collect()
    }

    #[test]
    fn namespace_order_is_declaration_order() {
        let policy = RoutingPolicy::from_settings(&settings());
        let model = ModelName::parse("acme/modelX").unwrap();
        let candidates = policy.candidates(&model).unwrap();
        assert_eq!(providers(&candidates), vec!["p1", "p2", "p3"]);
        assert_eq!(candidates[0].model, "acme/modelX");
    }

    #[test]
    fn equal_priority_keeps_declaration_order() {
        let policy = RoutingPolicy::from_settings(&settings());
        let model = ModelName::parse("tied/m").unwrap();
        let candidates = policy.candidates(&model).unwrap();
        assert_eq!(providers(&candidates), vec!["c", "b", "a"]);
    }

    #[test]
    fn model_override_wins() {
        let policy = RoutingPolicy::from_settings(&settings());
        let model = ModelName::parse("acme/special").unwrap();
        let candidates = policy.candidates(&model).unwrap();
        assert_eq!(providers(&candidates), vec!["p3"]);
        assert_eq!(candidates[0].model, "acme/special-v2");
    }

    #[test]
    fn unknown_namespace_has_no_route() {
        let policy = RoutingPolicy::from_settings(&settings());
        let model = ModelName::parse("bogus/model").unwrap();
        assert_eq!(
            policy.candidates(&model),
            Err(PolicyError::NoRoute("bogus/model".to_string()))
        );
    }
}
