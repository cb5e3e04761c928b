use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const EXPECTED_PRODUCT_NAME: &str = "Jellyfin Server";
pub const PUBLIC_INFO_PATH: &str = "System/Info/Public";
pub const MINIMUM_SERVER_VERSION: ServerVersion = ServerVersion::new(10, 11, 0, 0);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_PUBLIC_INFO_BYTES: usize = 64 * 1024;

/// Fallbacks tried, in order, when the user typed a bare host name.
const BARE_HOST_FALLBACKS: [(&str, u16); 4] =
    [("https", 443), ("http", 80), ("https", 8920), ("http", 8096)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl ServerVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid server version {0:?}")]
pub struct VersionParseError(pub String);

impl FromStr for ServerVersion {
    type Err = VersionParseError;

    /// Accepts two to four dot-separated components; missing trailing
    /// components are zero, so "10.11.0" equals "10.11.0.0".
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionParseError(text.to_owned());
        let parts = text
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if !(2..=4).contains(&parts.len()) {
            return Err(invalid());
        }

        let component = |index: usize| parts.get(index).copied().unwrap_or(0);
        Ok(Self::new(component(0), component(1), component(2), component(3)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Please enter a server address.")]
    Empty,
    #[error("Please enter a valid server URL: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("could not reach the server: {message}")]
    Transport {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("server responded with HTTP status {status}")]
    HttpStatus { status: u16 },
    #[error("server redirected (HTTP {status}) without a Location header")]
    RedirectWithoutLocation { status: u16 },
    #[error("server identifies as {found:?}, expected \"Jellyfin Server\"")]
    ProductMismatch { found: String },
    #[error(
        "server version {found} is older than the minimum supported version {minimum}"
    )]
    VersionTooOld {
        found: ServerVersion,
        minimum: ServerVersion,
    },
    #[error("could not read server information: {0}")]
    Parse(String),
    #[error("no candidate endpoints to try")]
    NoCandidates,
}

impl ValidationError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Only transport failures are worth retrying without user input.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEndpoint {
    pub uri: Url,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedServer {
    pub resolved_uri: Url,
    pub version: ServerVersion,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid(ValidatedServer),
    Failed(ValidationError),
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    #[must_use]
    pub fn is_temporary_error(&self) -> bool {
        matches!(self, Self::Failed(err) if err.is_temporary())
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Failed(err) => err.retry_after(),
            Self::Valid(_) => None,
        }
    }

    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Failed(err) => Some(err.to_string()),
            Self::Valid(_) => None,
        }
    }

    #[must_use]
    pub fn resolved_uri(&self) -> Option<&Url> {
        match self {
            Self::Valid(server) => Some(&server.resolved_uri),
            Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub fn server_version(&self) -> Option<ServerVersion> {
        match self {
            Self::Valid(server) => Some(server.version),
            Self::Failed(_) => None,
        }
    }
}

/// Body of `GET {base}/System/Info/Public`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PublicSystemInfo {
    pub product_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
}

/// Turns raw user text into the ordered list of endpoints worth probing.
///
/// The order is authoritative: callers must try candidates front to back.
pub fn resolve_candidates(input: &str) -> Result<Vec<CandidateEndpoint>, InputError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(InputError::Empty);
    }

    let uris = match Url::parse(input) {
        Ok(uri) if is_http_scheme(uri.scheme()) => vec![uri],
        // "host:port" parses with the host in the scheme slot.
        Ok(uri) => reinterpret_scheme_as_host(&uri)?,
        Err(url::ParseError::RelativeUrlWithoutBase) => bare_host_candidates(input)?,
        Err(err) => return Err(InputError::Malformed(err.to_string())),
    };

    Ok(uris
        .into_iter()
        .enumerate()
        .map(|(rank, uri)| CandidateEndpoint { uri, rank })
        .collect())
}

fn is_http_scheme(scheme: &str) -> bool {
    scheme == "http" || scheme == "https"
}

fn malformed(err: url::ParseError) -> InputError {
    InputError::Malformed(err.to_string())
}

fn with_scheme_and_port(base: &Url, scheme: &str, port: u16) -> Result<Url, InputError> {
    let mut uri = base.clone();
    uri.set_scheme(scheme)
        .map_err(|()| InputError::Malformed(format!("cannot use scheme {scheme}")))?;
    uri.set_port(Some(port))
        .map_err(|()| InputError::Malformed(format!("cannot use port {port}")))?;
    Ok(uri)
}

fn bare_host_candidates(input: &str) -> Result<Vec<Url>, InputError> {
    let base = Url::parse(&format!("https://{input}")).map_err(malformed)?;
    if base.host_str().is_none_or(str::is_empty) {
        return Err(InputError::Malformed("missing host".to_owned()));
    }

    // Hosts the scheme parser skipped (IP literals) may still carry a port.
    if let Some(port) = base.port() {
        return Ok(vec![
            with_scheme_and_port(&base, "https", port)?,
            with_scheme_and_port(&base, "http", port)?,
        ]);
    }

    BARE_HOST_FALLBACKS
        .iter()
        .map(|(scheme, port)| with_scheme_and_port(&base, scheme, *port))
        .collect()
}

fn reinterpret_scheme_as_host(uri: &Url) -> Result<Vec<Url>, InputError> {
    let host = uri.scheme();
    let path = uri.path().trim_start_matches('/');
    let (leading, rest) = path.split_once('/').unwrap_or((path, ""));
    let explicit_port = leading.parse::<u16>().ok();
    // "host:0" names no real port; treat it like a bare host.
    if explicit_port == Some(0) {
        return bare_host_candidates(host);
    }

    let mut candidates = Vec::with_capacity(2);
    for (scheme, default_port) in [("https", 443), ("http", 80)] {
        let base = Url::parse(&format!("{scheme}://{host}")).map_err(malformed)?;
        let port = explicit_port.unwrap_or(default_port);
        let mut candidate = with_scheme_and_port(&base, scheme, port)?;
        match explicit_port {
            Some(_) => candidate.set_path(rest),
            None => candidate.set_path(path),
        }
        candidate.set_query(uri.query());
        candidates.push(candidate);
    }
    Ok(candidates)
}

/// Metadata endpoint for a validated base address, keeping any base path.
#[must_use]
pub fn public_info_url(base: &Url) -> Url {
    let mut url = base.clone();
    let path = format!("{}/{}", base.path().trim_end_matches('/'), PUBLIC_INFO_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Base address behind a redirect into the bundled web client.
///
/// A stock server answers `/` with `302 web/`, but its API stays one level up.
#[must_use]
pub fn strip_web_client_path(uri: &Url) -> Url {
    let path = uri.path();
    let prefix = path
        .strip_suffix("web/index.html")
        .or_else(|| path.strip_suffix("web/"))
        .or_else(|| path.strip_suffix("web"));
    match prefix {
        Some(prefix) if prefix.ends_with('/') => {
            let mut base = uri.clone();
            base.set_path(prefix);
            base.set_query(None);
            base.set_fragment(None);
            base
        }
        _ => uri.clone(),
    }
}

pub fn decode_public_info(body: &[u8]) -> Result<PublicSystemInfo, ValidationError> {
    if body.len() > MAX_PUBLIC_INFO_BYTES {
        return Err(ValidationError::Parse(format!(
            "response too large: {} bytes (max {MAX_PUBLIC_INFO_BYTES})",
            body.len()
        )));
    }
    serde_json::from_slice(body).map_err(|err| ValidationError::Parse(err.to_string()))
}

/// Applies the product and minimum version gate to decoded metadata.
pub fn check_public_info(info: &PublicSystemInfo) -> Result<ServerVersion, ValidationError> {
    if info.product_name != EXPECTED_PRODUCT_NAME {
        return Err(ValidationError::ProductMismatch {
            found: info.product_name.clone(),
        });
    }

    let version = info
        .version
        .parse::<ServerVersion>()
        .map_err(|err| ValidationError::Parse(err.to_string()))?;
    if version < MINIMUM_SERVER_VERSION {
        return Err(ValidationError::VersionTooOld {
            found: version,
            minimum: MINIMUM_SERVER_VERSION,
        });
    }
    Ok(version)
}
