//! KL-007: Git-hosted template sources — parsing, per-host auth, workdir naming.

use super::configuration::{Configuration, GitAuth};
use super::error::ValidationError;
use base64::Engine;
use url::Url;

/// Locator prefix marking a git-hosted module.
pub const GIT_PREFIX: &str = "git::";

/// A resolved `git::` template locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub url: Url,
    /// Lowercased host with any leading `www.` removed
    pub hostname: String,
}

pub fn is_git_source(locator: &str) -> bool {
    locator.starts_with(GIT_PREFIX)
}

/// Lowercase a host and strip a leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Parse a `git::<url>` locator into its URL and normalized hostname.
pub fn resolve(locator: &str) -> Result<GitSource, String> {
    let rest = locator
        .strip_prefix(GIT_PREFIX)
        .ok_or_else(|| format!("'{}' is not a git source (missing '{}')", locator, GIT_PREFIX))?;
    let url = Url::parse(rest).map_err(|e| format!("invalid git url '{}': {}", rest, e))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("git url '{}' has no host", rest))?;
    let hostname = normalize_host(host);
    Ok(GitSource { url, hostname })
}

/// Auth entry for a host, if configured.
pub fn auth_for<'a>(config: &'a Configuration, hostname: &str) -> Option<&'a GitAuth> {
    let key = normalize_host(hostname);
    config.recipe_config.git.pat.get(&key).or_else(|| {
        config
            .recipe_config
            .git
            .pat
            .iter()
            .find(|(h, _)| normalize_host(h) == key)
            .map(|(_, a)| a)
    })
}

/// Check one host's auth material for consistency.
pub fn validate_auth(owner: &str, host: &str, auth: &GitAuth) -> Result<(), ValidationError> {
    if auth.client_cert.is_some() != auth.client_key.is_some() {
        return Err(ValidationError::new(
            owner,
            format!(
                "git auth for '{}': client certificate and client key must be specified together",
                host
            ),
        ));
    }
    if let Some(proxy) = &auth.proxy_url {
        let parsed = Url::parse(proxy).map_err(|e| {
            ValidationError::new(
                owner,
                format!("git auth for '{}': invalid proxy url: {}", host, e),
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ValidationError::new(
                owner,
                format!(
                    "git auth for '{}': proxy url must use http or https, got '{}'",
                    host,
                    parsed.scheme()
                ),
            ));
        }
    }
    Ok(())
}

fn sanitize(part: &str, max: usize) -> String {
    let cleaned: String = part
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    trimmed.chars().take(max).collect()
}

/// Working-directory prefix unique to one resource instance.
///
/// Readable parts are sanitized and truncated; the hash over the raw,
/// separator-delimited names keeps distinct triples from colliding.
pub fn workdir_prefix(environment: &str, application: Option<&str>, resource: &str) -> String {
    let app = application.unwrap_or("");
    let mut hasher = blake3::Hasher::new();
    for part in [environment, app, resource] {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hasher.finalize().to_hex();
    let mut parts = vec![sanitize(environment, 16)];
    if !app.is_empty() {
        parts.push(sanitize(app, 16));
    }
    parts.push(sanitize(resource, 24));
    parts.retain(|p| !p.is_empty());
    format!("{}-{}-", parts.join("-"), &digest[..12])
}

/// Environment variable Terraform reads a host's token from.
pub fn tf_token_env_var(hostname: &str) -> String {
    let host = normalize_host(hostname).replace(['.', ':'], "_");
    format!("TF_TOKEN_{}", host)
}

/// Contents of a `.gitconfig` that routes the host through token auth.
pub fn gitconfig_contents(hostname: &str, token: &str) -> String {
    let basic =
        base64::engine::general_purpose::STANDARD.encode(format!("oauth2:{}", token).as_bytes());
    format!(
        "[url \"https://{host}/\"]\n\tinsteadOf = https://www.{host}/\n[http \"https://{host}/\"]\n\textraHeader = Authorization: Basic {basic}\n",
        host = hostname,
        basic = basic
    )
}

/// Contents of a `.terraformrc` with one credentials block per host.
pub fn terraformrc_contents(hosts: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (host, token) in hosts {
        out.push_str(&format!(
            "credentials \"{}\" {{\n  token = \"{}\"\n}}\n",
            host, token
        ));
    }
    out
}
