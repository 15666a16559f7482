use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! text_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

text_newtype!(TemplateId);

/// Opaque bearer token issued by the backend after a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank tokens; an empty token never counts as a session.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// User profile as returned by the backend. Kept as a JSON object so fields the
/// client does not know about survive a persist/restore cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Map<String, Value>);

impl Identity {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Parses the persisted text form. Anything but a JSON object is rejected.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(Self::from_value)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn seconds(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(username) = self.text("username") {
            return Some(username.to_string());
        }
        let full_name = [self.text("first_name"), self.text("last_name")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return Some(full_name);
        }
        self.text("name").map(str::to_string)
    }

    pub fn is_admin(&self) -> bool {
        self.0
            .get("is_admin")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A zero limit blocks every upload; only a missing field means no limit.
    pub fn usage_limit_secs(&self) -> Option<u64> {
        self.seconds("usage_limit_secs")
    }

    pub fn usage_total_secs(&self) -> u64 {
        self.seconds("usage_total_secs").unwrap_or(0)
    }

    pub fn usage_remaining_secs(&self) -> Option<u64> {
        self.usage_limit_secs()
            .map(|limit| limit.saturating_sub(self.usage_total_secs()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identity_rejects_non_object_json() {
        assert!(Identity::from_json("null").is_none());
        assert!(Identity::from_json("[1,2]").is_none());
        assert!(Identity::from_json("{not json").is_none());
        assert!(Identity::from_json(r#"{"name":"Alice"}"#).is_some());
    }

    #[test]
    fn identity_display_name_prefers_username_then_full_name() {
        let identity = Identity::from_value(json!({
            "username": "alice_tg",
            "first_name": "Alice",
            "last_name": "Liddell"
        }))
        .expect("object");
        assert_eq!(identity.display_name().as_deref(), Some("alice_tg"));

        let identity = Identity::from_value(json!({
            "username": "",
            "first_name": "Alice",
            "last_name": "Liddell"
        }))
        .expect("object");
        assert_eq!(identity.display_name().as_deref(), Some("Alice Liddell"));

        let identity = Identity::from_value(json!({"name": "Alice"})).expect("object");
        assert_eq!(identity.display_name().as_deref(), Some("Alice"));
    }

    #[test]
    fn usage_remaining_saturates_and_ignores_missing_limit() {
        let identity = Identity::from_value(json!({
            "usage_limit_secs": 600,
            "usage_total_secs": 900
        }))
        .expect("object");
        assert_eq!(identity.usage_remaining_secs(), Some(0));

        let identity = Identity::from_value(json!({"usage_total_secs": 10})).expect("object");
        assert_eq!(identity.usage_remaining_secs(), None);
        assert!(!identity.is_admin());
    }

    #[test]
    fn zero_usage_limit_leaves_nothing_remaining() {
        let identity = Identity::from_value(json!({
            "usage_limit_secs": 0,
            "usage_total_secs": 0
        }))
        .expect("object");
        assert_eq!(identity.usage_limit_secs(), Some(0));
        assert_eq!(identity.usage_remaining_secs(), Some(0));
    }

    #[test]
    fn blank_credentials_are_not_sessions() {
        assert!(Credential::new("   ").is_none());
        let credential = Credential::new("T1").expect("token");
        assert_eq!(credential.as_str(), "T1");
        assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
    }
}
