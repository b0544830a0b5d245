//! Upload policy: size ceiling and MIME accept/reject lists.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejected {
    #[error("content-length is required")]
    LengthRequired,
    #[error("content-length {0:?} is not a number")]
    InvalidLength(String),
    #[error("content-length {len} exceeds the limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },
    #[error("content type {0:?} is not accepted")]
    UnsupportedMediaType(String),
}

impl UploadRejected {
    /// HTTP status for the response carrying this rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            UploadRejected::LengthRequired => 411,
            UploadRejected::InvalidLength(_) => 400,
            UploadRejected::TooLarge { .. } => 413,
            UploadRejected::UnsupportedMediaType(_) => 415,
        }
    }
}

/// A request that passed the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Parsed `content-length`, when the request carried one.
    pub content_length: Option<u64>,
}

impl Accepted {
    pub fn status_code(&self) -> u16 {
        200
    }
}

/// Loaded from the `[upload]` table of the node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadPolicy {
    /// 0 means unlimited.
    #[serde(default)]
    pub max_size_bytes: u64,
    #[serde(default = "default_accept")]
    pub accept: Vec<String>,
    #[serde(default)]
    pub reject: Vec<String>,
}

fn default_accept() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 0,
            accept: default_accept(),
            reject: Vec::new(),
        }
    }
}

/// Exact match, or prefix match when the pattern ends in `*`.
fn matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => mime.starts_with(prefix),
        None => pattern == mime,
    }
}

impl UploadPolicy {
    /// Apply the policy to request headers and, if known, the content type.
    /// Header names compare case-insensitively.
    pub fn check<'a, I>(&self, headers: I, mime: Option<&str>) -> Result<Accepted, UploadRejected>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let declared = headers
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.trim());
        let content_length = match declared {
            Some(value) => Some(
                value
                    .parse::<u64>()
                    .map_err(|_| UploadRejected::InvalidLength(value.to_string()))?,
            ),
            None => None,
        };

        if self.max_size_bytes > 0 {
            let len = content_length.ok_or(UploadRejected::LengthRequired)?;
            if len > self.max_size_bytes {
                return Err(UploadRejected::TooLarge {
                    len,
                    max: self.max_size_bytes,
                });
            }
        }

        if let Some(mime) = mime {
            let accepted = self.accept.iter().any(|p| matches(p, mime));
            let rejected = self.reject.iter().any(|p| matches(p, mime));
            if !accepted || rejected {
                tracing::debug!(mime, accepted, rejected, "content type refused");
                return Err(UploadRejected::UnsupportedMediaType(mime.to_string()));
            }
        }

        Ok(Accepted { content_length })
    }
}
