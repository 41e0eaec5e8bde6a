//! Authentication method selection and validation.
//!
//! Only API-key authentication against xAI is supported.  The legacy method
//! names are still recognized so that stale settings produce a clear message
//! instead of a generic parse failure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Environment variable holding the xAI API key.
pub const GROK_API_KEY_ENV: &str = "GROK_API_KEY";

const MISSING_KEY_MESSAGE: &str = "GROK_API_KEY environment variable not found. Add that to your environment and try again (no reload needed if using .env)!";

const LEGACY_METHOD_MESSAGE: &str =
    "This authentication method is not supported in Grok CLI. Please use a Grok API key.";

const INVALID_METHOD_MESSAGE: &str = "Invalid auth method selected.";

/// How the session authenticates against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "grok-api-key")]
    GrokApiKey,
    #[serde(rename = "oauth-personal")]
    LoginWithGoogle,
    #[serde(rename = "gemini-api-key")]
    GeminiApiKey,
    #[serde(rename = "vertex-ai")]
    VertexAi,
    #[serde(rename = "cloud-shell")]
    CloudShell,
}

impl AuthType {
    /// The settings-file spelling of this method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GrokApiKey => "grok-api-key",
            Self::LoginWithGoogle => "oauth-personal",
            Self::GeminiApiKey => "gemini-api-key",
            Self::VertexAi => "vertex-ai",
            Self::CloudShell => "cloud-shell",
        }
    }

    /// Whether this is a method kept only for compatibility.
    pub fn is_legacy(self) -> bool {
        !matches!(self, Self::GrokApiKey)
    }

    /// The user-facing explanation for rejecting a legacy method.
    pub fn legacy_message() -> &'static str {
        LEGACY_METHOD_MESSAGE
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grok-api-key" => Ok(Self::GrokApiKey),
            "oauth-personal" => Ok(Self::LoginWithGoogle),
            "gemini-api-key" => Ok(Self::GeminiApiKey),
            "vertex-ai" => Ok(Self::VertexAi),
            "cloud-shell" => Ok(Self::CloudShell),
            other => Err(AgentError::Config {
                reason: format!("unknown auth method `{other}`"),
            }),
        }
    }
}

/// Check that `method` can be used with the current environment.
///
/// Returns `None` when it can, otherwise the message to show the user.
/// `env` looks up environment variables; callers pass `std::env::var(..).ok()`
/// after loading `.env`.
pub fn validate_auth_method<F>(method: &str, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match method.parse::<AuthType>() {
        Ok(AuthType::GrokApiKey) => {
            let has_key = env(GROK_API_KEY_ENV).is_some_and(|k| !k.is_empty());
            (!has_key).then(|| MISSING_KEY_MESSAGE.to_owned())
        }
        Ok(_) => Some(LEGACY_METHOD_MESSAGE.to_owned()),
        Err(_) => Some(INVALID_METHOD_MESSAGE.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key(name: &str) -> Option<String> {
        (name == GROK_API_KEY_ENV).then(|| "xai-test".to_owned())
    }

    fn without_key(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn api_key_method_is_valid_when_key_present() {
        assert_eq!(validate_auth_method("grok-api-key", with_key), None);
    }

    #[test]
    fn api_key_method_requires_key() {
        let message = validate_auth_method("grok-api-key", without_key).unwrap();
        assert!(message.starts_with("GROK_API_KEY environment variable not found"));
    }

    #[test]
    fn empty_key_counts_as_missing() {
        let message = validate_auth_method("grok-api-key", |_| Some(String::new()));
        assert!(message.is_some());
    }

    #[test]
    fn legacy_methods_are_rejected() {
        for method in ["oauth-personal", "gemini-api-key", "vertex-ai", "cloud-shell"] {
            assert_eq!(
                validate_auth_method(method, with_key).as_deref(),
                Some(LEGACY_METHOD_MESSAGE),
                "{method}"
            );
        }
    }

    #[test]
    fn unknown_method_is_invalid() {
        assert_eq!(
            validate_auth_method("magic", with_key).as_deref(),
            Some("Invalid auth method selected.")
        );
    }

    #[test]
    fn string_forms_round_trip() {
        for auth in [
            AuthType::GrokApiKey,
            AuthType::LoginWithGoogle,
            AuthType::GeminiApiKey,
            AuthType::VertexAi,
            AuthType::CloudShell,
        ] {
            assert_eq!(auth.as_str().parse::<AuthType>().unwrap(), auth);
        }
        assert!(!AuthType::GrokApiKey.is_legacy());
        assert!(AuthType::CloudShell.is_legacy());
    }
}
