use serde::{Deserialize, Serialize};

const MAX_ID_LEN: usize = 128;

/// A video to thumbnail: an opaque id plus the locator of a playable resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoRef {
    pub id: String,
    #[serde(rename = "url")]
    pub resource_locator: String,
}

impl VideoRef {
    pub fn new(id: impl Into<String>, resource_locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_locator: resource_locator.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn locator(&self) -> &str {
        &self.resource_locator
    }

    /// Resolve a scheme-less locator (a bare upload filename) against `base`.
    pub fn resolved(mut self, base: Option<&str>) -> Self {
        if let Some(base) = base
            && !has_scheme(&self.resource_locator)
        {
            self.resource_locator = format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.resource_locator.trim_start_matches('/')
            );
        }
        self
    }

    /// Whether the locator is an http(s) URL with a host. Anything else
    /// (local paths, `file:`, `concat:`) is never handed to the decoder.
    pub fn is_network(&self) -> bool {
        let Some((scheme, rest)) = self.resource_locator.split_once("://") else {
            return false;
        };
        let host = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('@')
            .next()
            .unwrap_or_default();
        (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
            && !host.is_empty()
    }
}

fn has_scheme(locator: &str) -> bool {
    locator.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+')
    })
}

/// Ids end up in URL paths, so keep them to a plain token.
pub fn is_valid_video_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.contains('/')
        && !id.contains('.')
        && !id.chars().any(char::is_whitespace)
}
