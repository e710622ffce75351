use crate::error::{DownloadError, Result};
use ferry_core::prelude::UriResolver;
use reqwest::Url;

/// Resolves `name` to `<base_url>/<name>`, percent-encoding the name.
#[derive(Debug, Clone)]
pub struct BaseUrlResolver {
    base_url: Url,
    user_agent: Option<String>,
}

impl BaseUrlResolver {
    pub fn new(base_url: &str, user_agent: Option<String>) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| DownloadError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DownloadError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            base_url,
            user_agent,
        })
    }
}

impl UriResolver for BaseUrlResolver {
    fn uri(&self, name: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url.to_string()
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.clone()
    }
}
