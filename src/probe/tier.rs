//! Account tier classification from the `loadCodeAssist` response.

use serde::Deserialize;
use serde_json::Value;

/// Tier id that marks a paid (Pro) account.
pub const PRO_TIER_ID: &str = "standard-tier";

/// The parts of a `loadCodeAssist` response this crate consumes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierResponse {
    #[serde(default)]
    current_tier: Option<TierRef>,
    #[serde(default)]
    allowed_tiers: Option<Vec<AllowedTier>>,
    #[serde(default)]
    cloudaicompanion_project: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TierRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllowedTier {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    is_default: Option<bool>,
}

impl TierResponse {
    /// `currentTier.id`, or else the id of the first allowed tier flagged default.
    pub fn resolved_tier_id(&self) -> Option<&str> {
        let current = self
            .current_tier
            .as_ref()
            .and_then(|t| t.id.as_deref())
            .filter(|id| !id.is_empty());
        if current.is_some() {
            return current;
        }

        self.allowed_tiers
            .iter()
            .flatten()
            .find(|t| t.is_default == Some(true))
            .and_then(|t| t.id.as_deref())
    }

    pub fn is_pro(&self) -> bool {
        self.resolved_tier_id() == Some(PRO_TIER_ID)
    }

    /// The preview project linked to the account, if any.
    pub fn preview_project(&self) -> Option<String> {
        let id = match self.cloudaicompanion_project.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj.get("id")?.as_str()?,
            _ => return None,
        };
        (!id.is_empty()).then(|| id.to_string())
    }
}
