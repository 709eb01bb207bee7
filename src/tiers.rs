use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Tier granted to accounts whose tier is unknown or misconfigured.
pub const FALLBACK_TIER: &str = "free";

#[derive(Error, Debug)]
pub enum TierError {
    #[error("At least one tier limit must be configured")]
    NoTiers,

    #[error("Tier id must not be empty")]
    EmptyTierId,
}

/// Static descriptor of an account tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    pub tier_id: String,
    pub display_name: String,
    pub hourly_limit: u64,
}

/// Maps account tiers to hourly call quotas and holds the app-wide ceiling.
///
/// Lookups fail closed: an unknown tier resolves to the fallback tier, never
/// to an unbounded quota.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    limits: BTreeMap<String, u64>,
    fallback: String,
    global_limit: u64,
}

impl TierRegistry {
    pub fn new(limits: &BTreeMap<String, u64>, global_limit: u64) -> Result<Self, TierError> {
        let mut normalized = BTreeMap::new();
        for (tier, limit) in limits {
            let id = normalize_tier_id(tier);
            if id.is_empty() {
                return Err(TierError::EmptyTierId);
            }
            normalized.insert(id, *limit);
        }

        // Prefer the free tier; otherwise fall back to the most conservative quota
        let fallback = if normalized.contains_key(FALLBACK_TIER) {
            FALLBACK_TIER.to_string()
        } else {
            normalized
                .iter()
                .min_by_key(|(_, limit)| **limit)
                .map(|(id, _)| id.clone())
                .ok_or(TierError::NoTiers)?
        };

        Ok(Self {
            limits: normalized,
            fallback,
            global_limit,
        })
    }

    /// Hourly quota for a tier.
    pub fn limit_for(&self, tier_id: &str) -> u64 {
        self.resolve(tier_id).hourly_limit
    }

    /// The tier whose quota applies to `tier_id`, after the fail-closed mapping.
    pub fn resolve(&self, tier_id: &str) -> TierInfo {
        let id = normalize_tier_id(tier_id);
        match self.limits.get(&id) {
            Some(limit) => Self::info(&id, *limit),
            None => {
                tracing::debug!(tier = %tier_id, fallback = %self.fallback, "Unknown tier, applying fallback quota");
                let limit = self.limits.get(&self.fallback).copied().unwrap_or(0);
                Self::info(&self.fallback, limit)
            }
        }
    }

    /// App-wide ceiling mirroring the upstream API's own hourly limit.
    pub fn global_limit(&self) -> u64 {
        self.global_limit
    }

    pub fn fallback_tier(&self) -> &str {
        &self.fallback
    }

    /// All configured tiers, smallest quota first.
    pub fn tiers(&self) -> Vec<TierInfo> {
        let mut tiers: Vec<TierInfo> = self
            .limits
            .iter()
            .map(|(id, limit)| Self::info(id, *limit))
            .collect();
        tiers.sort_by(|a, b| {
            a.hourly_limit
                .cmp(&b.hourly_limit)
                .then_with(|| a.tier_id.cmp(&b.tier_id))
        });
        tiers
    }

    fn info(id: &str, limit: u64) -> TierInfo {
        TierInfo {
            tier_id: id.to_string(),
            display_name: display_name(id),
            hourly_limit: limit,
        }
    }
}

/// Normalize a tier id for lookup: trimmed and lowercased
pub fn normalize_tier_id(tier_id: &str) -> String {
    tier_id.trim().to_lowercase()
}

fn display_name(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
