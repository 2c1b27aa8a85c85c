//! Credential signal extraction
//!
//! Scans a single request and collects every identity signal it carries.
//! Purely syntactic: nothing is validated or verified here, and the request
//! is not modified, so extraction can run any number of times per request.

use axum::http::{header, HeaderMap};
use huerto_shared::Provenance;
use url::Url;

use super::cookies::{self, BACKUP_DATA_COOKIE, BACKUP_UID_COOKIE, ID_TOKEN_COOKIE, SESSION_COOKIE};
use super::sessions::Session;

/// Query/form parameter carrying a uid
pub const UID_PARAM: &str = "uid";
/// Query/form parameter carrying the provenance marker
pub const FROM_PARAM: &str = "from";
/// Query parameter carrying the development bypass token
pub const DEV_TOKEN_PARAM: &str = "dev_token";

/// Where a credential signal came from, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CredentialOrigin {
    ExistingServerSession,
    DevToken,
    BearerHeader,
    IdTokenCookie,
    SessionCookie,
    BackupUidCookie,
    BackupDataCookie,
    UrlUidParam,
    FormUidParam,
    RefererUidParam,
}

impl CredentialOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExistingServerSession => "existing_server_session",
            Self::DevToken => "dev_token",
            Self::BearerHeader => "bearer_header",
            Self::IdTokenCookie => "id_token_cookie",
            Self::SessionCookie => "session_cookie",
            Self::BackupUidCookie => "backup_uid_cookie",
            Self::BackupDataCookie => "backup_data_cookie",
            Self::UrlUidParam => "url_uid_param",
            Self::FormUidParam => "form_uid_param",
            Self::RefererUidParam => "referer_uid_param",
        }
    }

    /// Cookies that only mirror a server session
    pub fn is_mirror(&self) -> bool {
        matches!(self, Self::BackupUidCookie | Self::BackupDataCookie)
    }
}

/// A raw credential signal
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    DevToken(String),
    BearerHeader(String),
    IdTokenCookie(String),
    SessionCookie(String),
    BackupUidCookie(String),
    BackupDataCookie(String),
    UrlUidParam(String),
    FormUidParam(String),
    RefererUidParam {
        uid: String,
        host: Option<String>,
        provenance: Option<Provenance>,
    },
}

impl Credential {
    pub fn origin(&self) -> CredentialOrigin {
        match self {
            Self::DevToken(_) => CredentialOrigin::DevToken,
            Self::BearerHeader(_) => CredentialOrigin::BearerHeader,
            Self::IdTokenCookie(_) => CredentialOrigin::IdTokenCookie,
            Self::SessionCookie(_) => CredentialOrigin::SessionCookie,
            Self::BackupUidCookie(_) => CredentialOrigin::BackupUidCookie,
            Self::BackupDataCookie(_) => CredentialOrigin::BackupDataCookie,
            Self::UrlUidParam(_) => CredentialOrigin::UrlUidParam,
            Self::FormUidParam(_) => CredentialOrigin::FormUidParam,
            Self::RefererUidParam { .. } => CredentialOrigin::RefererUidParam,
        }
    }
}

// Tokens and session ids never show up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DevToken(_)
            | Self::BearerHeader(_)
            | Self::IdTokenCookie(_)
            | Self::SessionCookie(_) => write!(f, "{}(<redacted>)", self.origin().as_str()),
            Self::BackupDataCookie(_) => write!(f, "{}(..)", self.origin().as_str()),
            Self::BackupUidCookie(uid) | Self::UrlUidParam(uid) | Self::FormUidParam(uid) => {
                write!(f, "{}({})", self.origin().as_str(), uid)
            }
            Self::RefererUidParam {
                uid,
                host,
                provenance,
            } => f
                .debug_struct("referer_uid_param")
                .field("uid", uid)
                .field("host", host)
                .field("provenance", provenance)
                .finish(),
        }
    }
}

/// All credential signals of one request, ordered by precedence, at most one
/// per origin
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    candidates: Vec<Credential>,
    provenance: Option<Provenance>,
    server_session: Option<Session>,
    session_expired: bool,
}

impl CredentialSet {
    /// Add a candidate unless one from the same origin is already present
    pub fn insert(&mut self, credential: Credential) {
        let origin = credential.origin();
        if self.candidates.iter().any(|c| c.origin() == origin) {
            return;
        }
        let position = self
            .candidates
            .iter()
            .position(|c| c.origin() > origin)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(position, credential);
    }

    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }

    /// Attach the server-side session looked up for this request's session
    /// cookie. Only sessions that passed the store's validity check belong
    /// here.
    pub fn attach_server_session(&mut self, session: Option<Session>) {
        self.server_session = session;
    }

    /// The session cookie named a session that has just been voided by age
    pub fn mark_session_expired(&mut self) {
        self.session_expired = true;
    }

    pub fn session_expired(&self) -> bool {
        self.session_expired
    }

    pub fn candidates(&self) -> &[Credential] {
        &self.candidates
    }

    pub fn origins(&self) -> Vec<CredentialOrigin> {
        let mut origins: Vec<_> = self.candidates.iter().map(Credential::origin).collect();
        if self.server_session.is_some() {
            origins.insert(0, CredentialOrigin::ExistingServerSession);
        }
        origins
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.server_session.is_none()
    }

    pub fn provenance(&self) -> Option<Provenance> {
        self.provenance
    }

    pub fn server_session(&self) -> Option<&Session> {
        self.server_session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.find(|c| match c {
            Credential::SessionCookie(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn dev_token(&self) -> Option<&str> {
        self.find(|c| match c {
            Credential::DevToken(token) => Some(token.as_str()),
            _ => None,
        })
    }

    /// The token to verify: the bearer header wins over the id token cookie
    pub fn identity_token(&self) -> Option<(&str, CredentialOrigin)> {
        self.find(|c| match c {
            Credential::BearerHeader(token) => Some((token.as_str(), CredentialOrigin::BearerHeader)),
            Credential::IdTokenCookie(token) => Some((token.as_str(), CredentialOrigin::IdTokenCookie)),
            _ => None,
        })
    }

    pub fn backup_uid(&self) -> Option<&str> {
        self.find(|c| match c {
            Credential::BackupUidCookie(uid) => Some(uid.as_str()),
            _ => None,
        })
    }

    pub fn backup_data(&self) -> Option<&str> {
        self.find(|c| match c {
            Credential::BackupDataCookie(raw) => Some(raw.as_str()),
            _ => None,
        })
    }

    /// uid carried by the URL, then by the form body
    pub fn param_uid(&self) -> Option<(&str, CredentialOrigin)> {
        self.find(|c| match c {
            Credential::UrlUidParam(uid) => Some((uid.as_str(), CredentialOrigin::UrlUidParam)),
            Credential::FormUidParam(uid) => Some((uid.as_str(), CredentialOrigin::FormUidParam)),
            _ => None,
        })
    }

    pub fn referer_uid(&self) -> Option<(&str, Option<&str>, Option<Provenance>)> {
        self.find(|c| match c {
            Credential::RefererUidParam {
                uid,
                host,
                provenance,
            } => Some((uid.as_str(), host.as_deref(), *provenance)),
            _ => None,
        })
    }

    fn find<'a, T>(&'a self, f: impl FnMut(&'a Credential) -> Option<T>) -> Option<T> {
        self.candidates.iter().find_map(f)
    }
}

/// Extract every credential signal from a request.
///
/// `query` is the raw URI query string and `form` the raw
/// `application/x-www-form-urlencoded` body, when there is one.
pub fn extract(headers: &HeaderMap, query: Option<&str>, form: Option<&str>) -> CredentialSet {
    let mut set = CredentialSet::default();

    if let Some(token) = bearer_token(headers) {
        set.insert(Credential::BearerHeader(token));
    }
    if let Some(token) = cookies::get_cookie(headers, ID_TOKEN_COOKIE) {
        set.insert(Credential::IdTokenCookie(token));
    }
    if let Some(id) = cookies::get_cookie(headers, SESSION_COOKIE) {
        set.insert(Credential::SessionCookie(id));
    }
    if let Some(raw) = cookies::get_cookie(headers, BACKUP_UID_COOKIE) {
        let decoded = match urlencoding::decode(&raw) {
            Ok(uid) => uid.into_owned(),
            Err(_) => raw.clone(),
        };
        if let Some(uid) = non_empty(&decoded) {
            set.insert(Credential::BackupUidCookie(uid));
        }
    }
    if let Some(raw) = cookies::get_cookie(headers, BACKUP_DATA_COOKIE) {
        set.insert(Credential::BackupDataCookie(raw));
    }

    let query_params = parse_params(query);
    let form_params = parse_params(form);

    if let Some(token) = lookup(&query_params, DEV_TOKEN_PARAM) {
        set.insert(Credential::DevToken(token));
    }
    if let Some(uid) = lookup(&query_params, UID_PARAM) {
        set.insert(Credential::UrlUidParam(uid));
    }
    if let Some(uid) = lookup(&form_params, UID_PARAM) {
        set.insert(Credential::FormUidParam(uid));
    }
    if let Some(credential) = referer_credential(headers) {
        set.insert(credential);
    }

    let provenance = lookup(&query_params, FROM_PARAM)
        .or_else(|| lookup(&form_params, FROM_PARAM))
        .and_then(|from| from.parse::<Provenance>().ok());

    set.with_provenance(provenance)
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    non_empty(token)
}

fn referer_credential(headers: &HeaderMap) -> Option<Credential> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    let url = Url::parse(referer).ok()?;
    let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let uid = lookup(&params, UID_PARAM)?;
    let provenance = lookup(&params, FROM_PARAM).and_then(|from| from.parse().ok());
    Some(Credential::RefererUidParam {
        uid,
        host: url.host_str().map(str::to_lowercase),
        provenance,
    })
}

fn parse_params(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// First non-empty value for `key`
fn lookup(params: &[(String, String)], key: &str) -> Option<String> {
    params
        .iter()
        .filter(|(k, _)| k == key)
        .find_map(|(_, v)| non_empty(v))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
