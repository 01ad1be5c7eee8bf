//! Request envelopes and throttle keys.

use serde::{Deserialize, Serialize};

/// The identifying attributes of an inbound API call.
///
/// All fields are opaque strings owned by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub app_key: String,
    pub api_key: String,
    pub resource_key: String,
    pub app_tier: String,
    pub api_tier: String,
    pub resource_tier: String,
}

impl RequestEnvelope {
    /// Read a single field of the envelope.
    pub fn field(&self, field: RequestField) -> &str {
        match field {
            RequestField::AppKey => &self.app_key,
            RequestField::ApiKey => &self.api_key,
            RequestField::ResourceKey => &self.resource_key,
            RequestField::AppTier => &self.app_tier,
            RequestField::ApiTier => &self.api_tier,
            RequestField::ResourceTier => &self.resource_tier,
        }
    }
}

/// Names of the envelope fields, used by templates to build throttle keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestField {
    AppKey,
    ApiKey,
    ResourceKey,
    AppTier,
    ApiTier,
    ResourceTier,
}

/// A key that identifies a countable resource+tier combination.
///
/// Keys are produced by rule evaluators; the coordinator only carries them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThrottleKey(String);

impl ThrottleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from envelope fields, joined by `:`.
    pub fn from_fields(request: &RequestEnvelope, fields: &[RequestField]) -> Self {
        let parts: Vec<&str> = fields.iter().map(|f| request.field(*f)).collect();
        Self(parts.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThrottleKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestEnvelope {
        RequestEnvelope {
            app_key: "user1".to_string(),
            api_key: "api1".to_string(),
            resource_key: "/orders".to_string(),
            app_tier: "Gold".to_string(),
            api_tier: "Unlimited".to_string(),
            resource_tier: "Basic".to_string(),
        }
    }

    #[test]
    fn test_key_from_fields() {
        let key = ThrottleKey::from_fields(&request(), &[RequestField::ApiKey, RequestField::AppKey]);
        assert_eq!(key.as_str(), "api1:user1");
    }

    #[test]
    fn test_key_single_field() {
        let key = ThrottleKey::from_fields(&request(), &[RequestField::ResourceKey]);
        assert_eq!(key.to_string(), "/orders");
    }

    #[test]
    fn test_field_lookup() {
        let req = request();
        assert_eq!(req.field(RequestField::AppTier), "Gold");
        assert_eq!(req.field(RequestField::ResourceTier), "Basic");
    }
}
