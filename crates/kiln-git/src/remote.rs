//! Repository URL handling
//!
//! Parses owner and repository name out of the URL forms the coordinator hands
//! out, derives the on-disk workspace directory name, and injects/scrubs hosting
//! credentials.

use kiln_core::{KilnError, Result};

/// Owner/name pair identifying a repository on the hosting service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// Host, when the URL names one (`None` for local paths)
    pub host: Option<String>,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parse a repository URL.
    ///
    /// Accepted forms:
    /// - `https://host/owner/repo(.git)`
    /// - `ssh://git@host/owner/repo(.git)`
    /// - `git@host:owner/repo(.git)`
    /// - `file:///path/to/repo` or a plain filesystem path
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(KilnError::InvalidRepoUrl("empty URL".to_string()));
        }

        if let Some((scheme, rest)) = url.split_once("://") {
            return match scheme {
                "http" | "https" | "ssh" | "git" => {
                    let (authority, path) = rest.split_once('/').ok_or_else(|| {
                        KilnError::InvalidRepoUrl(format!("{}: missing repository path", url))
                    })?;
                    let host = authority
                        .rsplit_once('@')
                        .map(|(_, h)| h)
                        .unwrap_or(authority);
                    Self::from_path(Some(host.to_string()), path, url, true)
                }
                "file" => Self::from_path(None, rest, url, false),
                other => Err(KilnError::InvalidRepoUrl(format!(
                    "{}: unsupported scheme '{}'",
                    url, other
                ))),
            };
        }

        // scp-like syntax: user@host:owner/repo.git
        if let Some((user_host, path)) = url.split_once(':') {
            if let Some((_, host)) = user_host.split_once('@') {
                if !host.is_empty() && !user_host.contains('/') {
                    return Self::from_path(Some(host.to_string()), path, url, true);
                }
            }
        }

        Self::from_path(None, url, url, false)
    }

    fn from_path(host: Option<String>, path: &str, url: &str, remote: bool) -> Result<Self> {
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();

        let name = segments
            .last()
            .map(|s| s.trim_end_matches(".git"))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KilnError::InvalidRepoUrl(format!("{}: missing repository name", url)))?;

        let owner = match segments.len() {
            0 | 1 if remote => {
                return Err(KilnError::InvalidRepoUrl(format!(
                    "{}: expected <owner>/<repository>",
                    url
                )))
            }
            0 | 1 => "local",
            n => segments[n - 2],
        };

        Ok(Self {
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Directory name for this repository's checkout under the work dir.
    ///
    /// `<host>__<owner>__<name>` for remote URLs, `<owner>__<name>` for local paths.
    pub fn workspace_dir_name(&self) -> String {
        let repo = format!("{}__{}", sanitize(&self.owner), sanitize(&self.name));
        match &self.host {
            Some(host) => format!("{}__{}", sanitize(&host.to_ascii_lowercase()), repo),
            None => repo,
        }
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Embed a hosting token into an https clone URL.
///
/// URLs that are not https, or that already carry credentials, are returned unchanged.
pub fn authenticated_url(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }
    match url.strip_prefix("https://") {
        Some(rest) => {
            let authority = rest.split('/').next().unwrap_or("");
            if authority.contains('@') {
                url.to_string()
            } else {
                format!("https://x-access-token:{}@{}", token, rest)
            }
        }
        None => url.to_string(),
    }
}

/// Replace every occurrence of `secret` in `text` with `***`
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, "***")
    }
}
