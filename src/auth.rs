//! Caller authentication for the chat endpoint.
//!
//! Embed widgets authenticate with an opaque `x-embed-token`; signed-in users
//! send `Authorization: Bearer <session>`. The embed token wins when both are
//! present.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::store::ChatStore;
use crate::types::{ClientAccount, Conversation, StaffMember};

pub const EMBED_TOKEN_HEADER: &str = "x-embed-token";
pub const EMBED_ORIGIN_HEADER: &str = "x-embed-origin";

#[derive(Debug, Clone)]
pub struct EmbedCaller {
    pub token_id: String,
    pub organization_id: String,
    pub origin_host: Option<String>,
    pub welcome_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Caller {
    Embed(EmbedCaller),
    Client(ClientAccount),
    Staff(StaffMember),
}

impl Caller {
    pub fn organization_id(&self) -> Option<&str> {
        match self {
            Self::Embed(embed) => Some(&embed.organization_id),
            Self::Client(client) => Some(&client.organization_id),
            Self::Staff(_) => None,
        }
    }

    pub fn staff(&self) -> Option<&StaffMember> {
        match self {
            Self::Staff(staff) => Some(staff),
            _ => None,
        }
    }

    pub fn require_staff(&self) -> Result<&StaffMember, ApiError> {
        self.staff()
            .ok_or_else(|| ApiError::forbidden("staff access required"))
    }

    /// Staff see every conversation; everyone else only their organization's.
    pub fn ensure_access(&self, conversation: &Conversation) -> Result<(), ApiError> {
        match self.organization_id() {
            None => Ok(()),
            Some(org) if org == conversation.organization_id => Ok(()),
            Some(_) => Err(ApiError::forbidden(
                "conversation belongs to another organization",
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Embed(_) => "embed",
            Self::Client(_) => "client",
            Self::Staff(_) => "staff",
        }
    }
}

/// How bearer session tokens are turned into user ids.
pub enum SessionResolver {
    /// Looks the SHA-256 of the token up in `auth_sessions`.
    Database,
    /// Asks a GoTrue-compatible auth server (`GET /auth/v1/user`).
    Remote(RemoteAuth),
}

pub struct RemoteAuth {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
}

impl RemoteAuth {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn user_id(&self, token: &str) -> Result<Option<String>, ApiError> {
        let mut request = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .bearer_auth(token);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        let response = request.send().await.map_err(|err| {
            tracing::error!(error = %err, url = %self.base_url, "auth server unreachable");
            auth_unavailable()
        })?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "auth server rejected session");
            return Ok(None);
        }
        let user = response.json::<RemoteUser>().await.map_err(|err| {
            tracing::error!(error = %err, url = %self.base_url, "invalid auth server response");
            auth_unavailable()
        })?;
        Ok(Some(user.id))
    }
}

/// Remote auth failures are logged in full but reported without upstream
/// details.
fn auth_unavailable() -> ApiError {
    ApiError::Internal("authentication service unavailable".to_string())
}

impl SessionResolver {
    async fn user_id(&self, store: &dyn ChatStore, token: &str) -> Result<Option<String>, ApiError> {
        match self {
            Self::Database => Ok(store.user_for_session(&hash_session_token(token)).await?),
            Self::Remote(remote) => remote.user_id(token).await,
        }
    }
}

pub fn hash_session_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = header_text(headers, "authorization")?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Extracts the lowercase host from an origin such as `https://a.b.org:8443/x`.
/// Bare hosts without a scheme are accepted too.
pub fn origin_host(origin: &str) -> Option<String> {
    let origin = origin.trim();
    if origin.is_empty() || origin == "null" {
        return None;
    }
    if let Ok(parsed) = url::Url::parse(origin) {
        if let Some(host) = parsed.host_str() {
            return Some(host.trim_end_matches('.').to_ascii_lowercase());
        }
    }
    let host = origin
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");
    normalize_domain(host)
}

fn domain_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*$")
                .ok()
        })
        .as_ref()
}

/// Normalizes an allow-list entry: drops scheme, port, path and a leading
/// `*.`, lowercases it, and rejects anything that is not a hostname.
pub fn normalize_domain(entry: &str) -> Option<String> {
    let mut value = entry.trim().to_ascii_lowercase();
    if let Some((_, rest)) = value.split_once("://") {
        value = rest.to_string();
    }
    let value = value
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_string();
    domain_pattern()
        .is_some_and(|re| re.is_match(&value))
        .then_some(value)
}

/// Exact match or a subdomain on a label boundary: `acme.org` allows
/// `widget.acme.org` but not `evilacme.org`.
pub fn domain_allowed(allowed_domains: &[String], host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed_domains
        .iter()
        .filter_map(|entry| normalize_domain(entry))
        .any(|domain| {
            host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
}

pub async fn authenticate(
    store: &dyn ChatStore,
    sessions: &SessionResolver,
    headers: &HeaderMap,
) -> Result<Caller, ApiError> {
    if let Some(token) = header_text(headers, EMBED_TOKEN_HEADER) {
        return authenticate_embed(store, headers, token).await;
    }

    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::unauthorized("missing credentials"));
    };
    let user_id = sessions
        .user_id(store, token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid session"))?;

    if let Some(staff) = store.active_staff_for_user(&user_id).await? {
        return Ok(Caller::Staff(staff));
    }
    if let Some(client) = store.client_account_for_user(&user_id).await? {
        return Ok(Caller::Client(client));
    }
    tracing::debug!(user_id = %user_id, "session user has no staff or client record");
    Err(ApiError::forbidden("user has no chat access"))
}

async fn authenticate_embed(
    store: &dyn ChatStore,
    headers: &HeaderMap,
    token: &str,
) -> Result<Caller, ApiError> {
    let embed = store
        .embed_token_by_value(token)
        .await?
        .filter(|embed| embed.is_active)
        .ok_or_else(|| ApiError::unauthorized("invalid embed token"))?;

    let origin_host = header_text(headers, EMBED_ORIGIN_HEADER)
        .or_else(|| header_text(headers, "origin"))
        .and_then(origin_host);

    if !embed.allowed_domains.is_empty() {
        let allowed = origin_host
            .as_deref()
            .is_some_and(|host| domain_allowed(&embed.allowed_domains, host));
        if !allowed {
            tracing::warn!(
                token_id = %embed.id,
                origin = origin_host.as_deref().unwrap_or("<none>"),
                "embed origin not in allow-list"
            );
            return Err(ApiError::forbidden("origin not allowed for this embed token"));
        }
    }

    store.record_embed_token_use(&embed.id).await?;

    Ok(Caller::Embed(EmbedCaller {
        token_id: embed.id,
        organization_id: embed.organization_id,
        origin_host,
        welcome_message: embed.welcome_message.filter(|m| !m.trim().is_empty()),
    }))
}
