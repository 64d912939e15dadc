use serde::Deserialize;
use std::fmt;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// where and as whom chat requests are sent.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub project_id: String,
    /// bearer credential.
    pub api_key: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Endpoint {
    pub fn new(project_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            project_id: project_id.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `{base}/api/project/{project}/chat`
    pub fn chat_url(&self) -> String {
        format!(
            "{}/api/project/{}/chat",
            self.base_url.trim_end_matches('/'),
            self.project_id
        )
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

// keep keys out of logs
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("api_key", &if self.api_key.is_empty() { "<empty>" } else { "<redacted>" })
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chat_url_normalizes_trailing_slash() {
        let ep = Endpoint::new("p1", "k").with_base_url("https://chat.example.com/");
        assert_eq!(ep.chat_url(), "https://chat.example.com/api/project/p1/chat");
        assert_eq!(Endpoint::new("p2", "k").chat_url(), "http://localhost:8000/api/project/p2/chat");
    }

    #[test]
    fn deserializes_with_default_base() {
        let ep: Endpoint = serde_json::from_str(r#"{"project_id":"p","api_key":"secret"}"#).unwrap();
        assert_eq!(ep.base_url, DEFAULT_BASE_URL);
        assert_eq!(ep.bearer(), "Bearer secret");
    }

    #[test]
    fn debug_redacts_key() {
        let shown = format!("{:?}", Endpoint::new("p", "secret"));
        assert!(!shown.contains("secret"), "{shown}");
    }
}
