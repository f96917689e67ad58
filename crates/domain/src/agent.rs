//! Sub-agent roles and capability tiers.
//!
//! Roles select a system-prompt template; tiers select a model class plus
//! its execution envelope (temperature, iteration cap, response budget).

use serde::{Deserialize, Serialize};

/// Specialist role of an orchestrated sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Lead,
    Backend,
    Frontend,
    Data,
    Design,
    Infra,
    Qa,
    RedTeam,
    Services,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Lead,
        AgentRole::Backend,
        AgentRole::Frontend,
        AgentRole::Data,
        AgentRole::Design,
        AgentRole::Infra,
        AgentRole::Qa,
        AgentRole::RedTeam,
        AgentRole::Services,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Lead => "lead",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Data => "data",
            AgentRole::Design => "design",
            AgentRole::Infra => "infra",
            AgentRole::Qa => "qa",
            AgentRole::RedTeam => "red_team",
            AgentRole::Services => "services",
        }
    }

    /// Parse a role name, accepting the legacy aliases the decomposition
    /// model still occasionally emits. Unknown names normalize to
    /// [`AgentRole::Services`].
    pub fn parse(s: &str) -> AgentRole {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lead" | "architect" | "coordinator" | "planner" => AgentRole::Lead,
            "backend" | "api" | "server" => AgentRole::Backend,
            "frontend" | "ui" | "web" => AgentRole::Frontend,
            "data" | "database" | "db" | "analytics" => AgentRole::Data,
            "design" | "ux" => AgentRole::Design,
            "infra" | "devops" | "ops" | "infrastructure" => AgentRole::Infra,
            "qa" | "test" | "testing" => AgentRole::Qa,
            "red_team" | "redteam" | "security" => AgentRole::RedTeam,
            _ => AgentRole::Services,
        }
    }

    /// Default capability tier for a role: the lead plans (elite), builders
    /// get the specialist class, verification roles run on the cheap tier.
    pub fn default_tier(self) -> AgentTier {
        match self {
            AgentRole::Lead => AgentTier::Elite,
            AgentRole::Qa | AgentRole::RedTeam => AgentTier::Utility,
            _ => AgentTier::Specialist,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete capability class selecting a model, temperature, iteration cap,
/// and token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTier {
    Elite,
    Specialist,
    Utility,
}

/// Execution envelope associated with a tier.
#[derive(Debug, Clone, Copy)]
pub struct TierParams {
    pub temperature: f32,
    pub max_iterations: u32,
    pub max_response_tokens: u32,
    pub token_budget: u32,
}

impl AgentTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentTier::Elite => "elite",
            AgentTier::Specialist => "specialist",
            AgentTier::Utility => "utility",
        }
    }

    pub fn params(self) -> TierParams {
        match self {
            AgentTier::Elite => TierParams {
                temperature: 0.5,
                max_iterations: 25,
                max_response_tokens: 8192,
                token_budget: 100_000,
            },
            AgentTier::Specialist => TierParams {
                temperature: 0.4,
                max_iterations: 15,
                max_response_tokens: 4096,
                token_budget: 50_000,
            },
            AgentTier::Utility => TierParams {
                temperature: 0.2,
                max_iterations: 8,
                max_response_tokens: 2048,
                token_budget: 16_000,
            },
        }
    }
}

impl std::fmt::Display for AgentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_aliases_normalize() {
        assert_eq!(AgentRole::parse("architect"), AgentRole::Lead);
        assert_eq!(AgentRole::parse("API"), AgentRole::Backend);
        assert_eq!(AgentRole::parse("red-team"), AgentRole::RedTeam);
        assert_eq!(AgentRole::parse("security"), AgentRole::RedTeam);
        assert_eq!(AgentRole::parse("devops"), AgentRole::Infra);
        assert_eq!(AgentRole::parse("something-else"), AgentRole::Services);
    }

    #[test]
    fn tier_params_are_ordered() {
        let elite = AgentTier::Elite.params();
        let util = AgentTier::Utility.params();
        assert!(elite.max_iterations > util.max_iterations);
        assert!(elite.max_response_tokens > util.max_response_tokens);
        assert!(elite.temperature > util.temperature);
    }

    #[test]
    fn role_serde_snake_case() {
        let json = serde_json::to_string(&AgentRole::RedTeam).unwrap();
        assert_eq!(json, "\"red_team\"");
    }
}
