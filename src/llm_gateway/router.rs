//! Provider selection policy: `by_role`, `by_cost`, `by_latency`.

use crate::config::{LlmConfig, RoutingPolicy};
use crate::domain::RoleTag;

fn latency_rank(class: &str) -> u8 {
    match class {
        "fast" => 0,
        "medium" => 1,
        "slow" => 2,
        _ => 3,
    }
}

/// Builds the ordered list of provider names to attempt for `role_tag`:
/// the policy's preferred provider first, then the rest of the fallback
/// chain, each name appearing at most once.
#[must_use]
pub fn candidate_order(config: &LlmConfig, role_tag: &RoleTag) -> Vec<String> {
    let mut ordered: Vec<String> = match config.policy {
        RoutingPolicy::ByRole => {
            let role_key = role_key(role_tag);
            let preferred = config.role_map.get(&role_key).cloned();
            preferred.into_iter().chain(config.fallback_chain.iter().cloned()).collect()
        }
        RoutingPolicy::ByCost => {
            let mut chain = config.fallback_chain.clone();
            chain.sort_by(|a, b| {
                let cost_a = config.providers.get(a).map(|p| p.cost_per_1k_tokens).unwrap_or(f64::MAX);
                let cost_b = config.providers.get(b).map(|p| p.cost_per_1k_tokens).unwrap_or(f64::MAX);
                cost_a.partial_cmp(&cost_b).unwrap_or(std::cmp::Ordering::Equal)
            });
            chain
        }
        RoutingPolicy::ByLatency => {
            let mut chain = config.fallback_chain.clone();
            chain.sort_by_key(|name| {
                config.providers.get(name).map(|p| latency_rank(&p.latency_class)).unwrap_or(u8::MAX)
            });
            chain
        }
    };

    let mut seen = std::collections::HashSet::new();
    ordered.retain(|name| seen.insert(name.clone()));
    ordered
}

fn role_key(role_tag: &RoleTag) -> String {
    match role_tag {
        RoleTag::Planning => "planning".to_string(),
        RoleTag::Execution => "execution".to_string(),
        RoleTag::Fast => "fast".to_string(),
        RoleTag::Embedding => "embedding".to_string(),
        RoleTag::Custom(name) => name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use std::collections::HashMap;

    fn provider(cost: f64, latency: &str) -> ProviderConfig {
        ProviderConfig { kind: "openai".into(), base_url: None, model_aliases: HashMap::new(), cost_per_1k_tokens: cost, latency_class: latency.into() }
    }

    #[test]
    fn by_cost_orders_cheapest_first() {
        let mut config = LlmConfig::default();
        config.policy = RoutingPolicy::ByCost;
        config.providers.insert("expensive".into(), provider(0.05, "fast"));
        config.providers.insert("cheap".into(), provider(0.01, "slow"));
        config.fallback_chain = vec!["expensive".into(), "cheap".into()];

        let order = candidate_order(&config, &RoleTag::Fast);
        assert_eq!(order, vec!["cheap".to_string(), "expensive".to_string()]);
    }

    #[test]
    fn by_role_prefers_mapped_provider() {
        let mut config = LlmConfig::default();
        config.policy = RoutingPolicy::ByRole;
        config.role_map.insert("planning".into(), "primary".into());
        config.fallback_chain = vec!["secondary".into(), "primary".into()];

        let order = candidate_order(&config, &RoleTag::Planning);
        assert_eq!(order.first(), Some(&"primary".to_string()));
    }
}
