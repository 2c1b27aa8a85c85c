//! Cookie names, parsing and `Set-Cookie` rendering
//!
//! The session is mirrored into three cookies (opaque session id, plain uid,
//! JSON metadata) so that a proxy hop dropping one of them does not log the
//! user out. All mirrors share path `/`, `SameSite=Lax` and a 24h max-age.

use axum::http::{header, HeaderMap, HeaderValue};
use huerto_shared::Plan;
use serde::{Deserialize, Serialize};

/// Primary session cookie (opaque id)
pub const SESSION_COOKIE: &str = "huerto_session";
/// Backup cookie carrying the plain uid
pub const BACKUP_UID_COOKIE: &str = "huerto_user_uid";
/// Backup cookie carrying URL-encoded JSON metadata
pub const BACKUP_DATA_COOKIE: &str = "huerto_user_data";
/// Short-lived copy of the last bearer token, for re-verification
pub const ID_TOKEN_COOKIE: &str = "firebase_id_token";

/// Max-age of the mirrored session cookies (24h)
pub const MIRROR_MAX_AGE_SECS: i64 = 86_400;
/// Max-age of the id token cookie (1h, provider tokens expire after that)
pub const ID_TOKEN_MAX_AGE_SECS: i64 = 3_600;

/// Contents of the backup metadata cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupData {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub authenticated: bool,
}

impl BackupData {
    /// Encode as a cookie-safe value (percent-encoded JSON)
    pub fn encode(&self) -> Result<String, CookieError> {
        let json = serde_json::to_string(self).map_err(|e| CookieError::Encode(e.to_string()))?;
        Ok(urlencoding::encode(&json).into_owned())
    }

    /// Decode a raw cookie value. Accepts both percent-encoded and bare JSON,
    /// since client-side scripts write the cookie too.
    pub fn decode(raw: &str) -> Result<Self, CookieError> {
        let decoded = urlencoding::decode(raw).map_err(|e| CookieError::Decode(e.to_string()))?;
        let data: BackupData =
            serde_json::from_str(&decoded).map_err(|e| CookieError::Decode(e.to_string()))?;
        if data.uid.trim().is_empty() {
            return Err(CookieError::Decode("empty uid".to_string()));
        }
        Ok(data)
    }
}

/// Find a cookie value by name across all `Cookie` headers.
/// The first occurrence wins; empty values count as absent.
pub fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// A single `Set-Cookie` instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieDirective {
    Set {
        name: &'static str,
        value: String,
        max_age_secs: i64,
        http_only: bool,
    },
    Clear {
        name: &'static str,
    },
}

impl CookieDirective {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set { name, .. } | Self::Clear { name } => name,
        }
    }

    /// Render the `Set-Cookie` header value
    pub fn render(&self, secure: bool) -> String {
        let mut out = match self {
            Self::Set {
                name,
                value,
                max_age_secs,
                http_only,
            } => {
                let mut s = format!("{}={}; Max-Age={}; Path=/; SameSite=Lax", name, value, max_age_secs);
                if *http_only {
                    s.push_str("; HttpOnly");
                }
                s
            }
            Self::Clear { name } => format!(
                "{}=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/; SameSite=Lax",
                name
            ),
        };
        if secure {
            out.push_str("; Secure");
        }
        out
    }
}

/// Ordered set of cookie instructions for one response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSet {
    directives: Vec<CookieDirective>,
}

impl CookieSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three mirrored session cookies. The session cookie is HttpOnly;
    /// the backup cookies stay readable because the client restores them.
    pub fn mirror(session_id: &str, data: &BackupData) -> Result<Self, CookieError> {
        let mut set = Self::new();
        set.push(CookieDirective::Set {
            name: SESSION_COOKIE,
            value: session_id.to_string(),
            max_age_secs: MIRROR_MAX_AGE_SECS,
            http_only: true,
        });
        set.push(CookieDirective::Set {
            name: BACKUP_UID_COOKIE,
            value: urlencoding::encode(&data.uid).into_owned(),
            max_age_secs: MIRROR_MAX_AGE_SECS,
            http_only: false,
        });
        set.push(CookieDirective::Set {
            name: BACKUP_DATA_COOKIE,
            value: data.encode()?,
            max_age_secs: MIRROR_MAX_AGE_SECS,
            http_only: false,
        });
        Ok(set)
    }

    /// Expire every identity cookie, including the id token copy
    pub fn clear_all() -> Self {
        let mut set = Self::new();
        for name in [SESSION_COOKIE, BACKUP_UID_COOKIE, BACKUP_DATA_COOKIE, ID_TOKEN_COOKIE] {
            set.push(CookieDirective::Clear { name });
        }
        set
    }

    pub fn id_token(token: &str) -> CookieDirective {
        CookieDirective::Set {
            name: ID_TOKEN_COOKIE,
            value: token.to_string(),
            max_age_secs: ID_TOKEN_MAX_AGE_SECS,
            http_only: true,
        }
    }

    /// Add a directive, replacing an earlier one for the same cookie
    pub fn push(&mut self, directive: CookieDirective) {
        self.directives.retain(|d| d.name() != directive.name());
        self.directives.push(directive);
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CookieDirective> {
        self.directives.iter()
    }

    pub fn get(&self, name: &str) -> Option<&CookieDirective> {
        self.directives.iter().find(|d| d.name() == name)
    }

    /// Rendered header values, in order
    pub fn header_values(&self, secure: bool) -> Vec<String> {
        self.directives.iter().map(|d| d.render(secure)).collect()
    }

    /// Append `Set-Cookie` headers to a response
    pub fn apply_to(&self, headers: &mut HeaderMap, secure: bool) {
        for rendered in self.header_values(secure) {
            match HeaderValue::from_str(&rendered) {
                Ok(value) => {
                    headers.append(header::SET_COOKIE, value);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unrepresentable Set-Cookie header");
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("Cookie encoding failed: {0}")]
    Encode(String),
    #[error("Cookie decoding failed: {0}")]
    Decode(String),
}
