//! Remote image deletion over the OCI distribution API
//!
//! Deleting a tag from a registry is a digest operation: the manifest the
//! tag points to is looked up, its `Docker-Content-Digest` is read, and the
//! manifest is deleted by digest. Every call may be answered with `401` and
//! a `WWW-Authenticate` challenge, in which case a scoped token is fetched
//! from the advertised realm and the call is retried once.
//!
//! Lookups try `HEAD` first, then `GET`, then a `GET` per media type, since
//! registries differ in which `Accept` combinations they honour. A `404` is
//! never trusted on its own: the tag list decides whether the image is
//! really gone.
//!
//! [`RegistryClient::delete_image`] never fails. Whatever happens is
//! returned as a [`DeletionOutcome`] and logged.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::{RegistryCredentials, RunnerConfig};

/// Manifest media types, in the order they are tried
pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Header carrying the manifest digest
pub const DIGEST_HEADER: &str = "Docker-Content-Digest";

const DEFAULT_TAG: &str = "latest";
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

static CHALLENGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)=(?:"([^"]*)"|([^,\s]*))"#).unwrap());

/// Registry call failure
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The HTTP request did not complete
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint refused the credentials
    #[error("token endpoint answered HTTP {status}")]
    Token {
        /// HTTP status.
        status: u16,
    },

    /// The challenge could not be satisfied
    #[error("unusable auth challenge: {0}")]
    Challenge(String),
}

/// A tag reference in a registry.
///
/// The digest is not part of the reference: it is looked up again before
/// every delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRef {
    /// Registry host, with port if any
    pub registry: String,
    /// Repository name, `namespace/repo`
    pub repository: String,
    /// Tag
    pub tag: String,
}

impl ManifestRef {
    /// Parses `registry/namespace/repo[:tag]`; the tag defaults to `latest`.
    ///
    /// Digest references (`...@sha256:...`) and references without a
    /// namespace are rejected.
    #[must_use]
    pub fn parse(image: &str) -> Option<Self> {
        if image.contains('@') || image.chars().any(char::is_whitespace) {
            return None;
        }
        let (registry, rest) = image.split_once('/')?;
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => (repository, tag),
            Some(_) => return None,
            None => (rest, DEFAULT_TAG),
        };

        let segments: Vec<&str> = repository.split('/').collect();
        if registry.is_empty()
            || tag.is_empty()
            || segments.len() < 2
            || segments.iter().any(|s| s.is_empty() || s.contains(':'))
        {
            return None;
        }

        Some(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Token scope for reads
    #[must_use]
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    /// Token scope for the delete call
    #[must_use]
    pub fn delete_scope(&self) -> String {
        format!("repository:{}:pull,push,delete", self.repository)
    }

    fn manifest_url(&self, base: &str, reference: &str) -> String {
        format!("{base}/v2/{}/manifests/{reference}", self.repository)
    }

    fn tags_url(&self, base: &str) -> String {
        format!("{base}/v2/{}/tags/list", self.repository)
    }
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Authentication scheme named by a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// Token from a separate realm
    Bearer,
    /// Plain username/password on every request
    Basic,
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Scheme of the challenge
    pub scheme: AuthScheme,
    /// Token endpoint
    pub realm: Option<String>,
    /// Service name to request the token for
    pub service: Option<String>,
    /// Scope the registry suggested
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parses a `Bearer` or `Basic` challenge; other schemes yield `None`
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));
        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            AuthScheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return None;
        };

        let mut challenge = Self {
            scheme,
            realm: None,
            service: None,
            scope: None,
        };
        for caps in CHALLENGE_PARAM.captures_iter(params) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .filter(|v| !v.is_empty());
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = value,
                "scope" => challenge.scope = value,
                _ => {}
            }
        }
        Some(challenge)
    }
}

/// Why a deletion was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No registry credentials configured
    NoCredentials,
    /// The image reference is not `registry/namespace/repo[:tag]`
    Unparseable,
}

/// Result of a remote deletion attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The manifest was deleted
    Deleted {
        /// Digest that was deleted
        digest: String,
    },
    /// The tag no longer exists
    AlreadyAbsent,
    /// The manifest lookup said 404 but the tag is still listed
    Inconsistent,
    /// The manifest was found without a digest header
    MissingDigest,
    /// The registry refused the delete
    Rejected {
        /// HTTP status of the delete call
        status: u16,
    },
    /// The manifest lookup failed with an unexpected status
    LookupFailed {
        /// HTTP status of the lookup
        status: u16,
    },
    /// Nothing was attempted
    Skipped(SkipReason),
    /// A request or token exchange failed
    Failed(String),
}

impl DeletionOutcome {
    /// True for outcomes that need no attention
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::Deleted { .. } | Self::AlreadyAbsent | Self::Skipped(_)
        )
    }
}

impl fmt::Display for DeletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted { digest } => write!(f, "deleted {digest}"),
            Self::AlreadyAbsent => write!(f, "already deleted"),
            Self::Inconsistent => write!(
                f,
                "manifest lookup returned 404 but the tag is still listed (Accept header mismatch?)"
            ),
            Self::MissingDigest => write!(f, "manifest response carried no {DIGEST_HEADER} header"),
            Self::Rejected { status } => write!(f, "delete rejected with HTTP {status}"),
            Self::LookupFailed { status } => write!(f, "manifest lookup failed with HTTP {status}"),
            Self::Skipped(SkipReason::NoCredentials) => write!(f, "skipped: no registry credentials"),
            Self::Skipped(SkipReason::Unparseable) => write!(f, "skipped: unparseable image reference"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// Registry API client used for cleanup
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    insecure: bool,
}

impl RegistryClient {
    /// Creates a client. `insecure` switches the API calls to plain HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Http`] when the HTTP client cannot be built.
    pub fn new(
        credentials: Option<RegistryCredentials>,
        insecure: bool,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            credentials,
            insecure,
        })
    }

    /// Creates a client from the runner configuration
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Http`] when the HTTP client cannot be built.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, RegistryError> {
        Self::new(
            config.registry_credentials.clone(),
            config.registry_insecure,
        )
    }

    /// Deletes the manifest `image` points to. Never fails; the outcome is
    /// logged and returned.
    pub async fn delete_image(&self, image: &str) -> DeletionOutcome {
        let outcome = match (&self.credentials, ManifestRef::parse(image)) {
            (None, _) => DeletionOutcome::Skipped(SkipReason::NoCredentials),
            (Some(_), None) => DeletionOutcome::Skipped(SkipReason::Unparseable),
            (Some(credentials), Some(manifest)) => {
                let scheme = if self.insecure { "http" } else { "https" };
                let mut session = Session {
                    client: &self.client,
                    credentials,
                    base: format!("{scheme}://{}", manifest.registry),
                    auth: HashMap::new(),
                };
                session
                    .delete(&manifest)
                    .await
                    .unwrap_or_else(|e| DeletionOutcome::Failed(e.to_string()))
            }
        };

        match &outcome {
            DeletionOutcome::Deleted { .. } | DeletionOutcome::AlreadyAbsent => {
                info!(image = %image, outcome = %outcome, "Remote image cleanup");
            }
            DeletionOutcome::Skipped(_) => {
                debug!(image = %image, outcome = %outcome, "Remote image cleanup");
            }
            _ => warn!(image = %image, outcome = %outcome, "Remote image cleanup incomplete"),
        }
        outcome
    }
}

#[derive(Debug, Clone)]
enum Authorization {
    Bearer(String),
    Basic,
}

#[derive(Debug)]
enum Lookup {
    Found { digest: Option<String> },
    NotFound,
    Failed(u16),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// State of one deletion: authorizations obtained so far, keyed by scope.
struct Session<'a> {
    client: &'a reqwest::Client,
    credentials: &'a RegistryCredentials,
    base: String,
    auth: HashMap<String, Authorization>,
}

impl Session<'_> {
    async fn delete(&mut self, manifest: &ManifestRef) -> Result<DeletionOutcome, RegistryError> {
        let digest = match self.lookup(manifest).await? {
            Lookup::Found {
                digest: Some(digest),
            } => digest,
            Lookup::Found { digest: None } => return Ok(DeletionOutcome::MissingDigest),
            Lookup::NotFound => return self.disambiguate(manifest).await,
            Lookup::Failed(status) => return Ok(DeletionOutcome::LookupFailed { status }),
        };

        let url = manifest.manifest_url(&self.base, &digest);
        let response = self
            .send(Method::DELETE, &url, None, &manifest.delete_scope())
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(DeletionOutcome::Deleted { digest })
            }
            StatusCode::NOT_FOUND => self.disambiguate(manifest).await,
            status => Ok(DeletionOutcome::Rejected {
                status: status.as_u16(),
            }),
        }
    }

    async fn lookup(&mut self, manifest: &ManifestRef) -> Result<Lookup, RegistryError> {
        let url = manifest.manifest_url(&self.base, &manifest.tag);
        let scope = manifest.pull_scope();
        let accept_all = MANIFEST_MEDIA_TYPES.join(", ");

        let mut response = self
            .send(Method::HEAD, &url, Some(&accept_all), &scope)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            response = self
                .send(Method::GET, &url, Some(&accept_all), &scope)
                .await?;
        }
        if response.status() == StatusCode::NOT_FOUND {
            for media_type in MANIFEST_MEDIA_TYPES {
                response = self
                    .send(Method::GET, &url, Some(media_type), &scope)
                    .await?;
                if response.status() != StatusCode::NOT_FOUND {
                    debug!(media_type, "Manifest found with a single media type");
                    break;
                }
            }
        }

        let status = response.status();
        Ok(if status.is_success() {
            let digest = response
                .headers()
                .get(DIGEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            Lookup::Found { digest }
        } else if status == StatusCode::NOT_FOUND {
            Lookup::NotFound
        } else {
            Lookup::Failed(status.as_u16())
        })
    }

    /// Decides what a 404 meant by checking whether the tag is still listed
    async fn disambiguate(
        &mut self,
        manifest: &ManifestRef,
    ) -> Result<DeletionOutcome, RegistryError> {
        let url = manifest.tags_url(&self.base);
        let response = self
            .send(Method::GET, &url, None, &manifest.pull_scope())
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(DeletionOutcome::AlreadyAbsent),
            status if status.is_success() => {
                let list: TagList = response.json().await?;
                let listed = list
                    .tags
                    .unwrap_or_default()
                    .iter()
                    .any(|t| *t == manifest.tag);
                Ok(if listed {
                    DeletionOutcome::Inconsistent
                } else {
                    DeletionOutcome::AlreadyAbsent
                })
            }
            status => Ok(DeletionOutcome::LookupFailed {
                status: status.as_u16(),
            }),
        }
    }

    /// Sends a request, answering one `401` challenge for `scope`
    async fn send(
        &mut self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        scope: &str,
    ) -> Result<Response, RegistryError> {
        let cached = self.auth.get(scope).cloned();
        let response = self
            .request(method.clone(), url, accept, cached.as_ref())
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = challenge_of(&response) else {
            debug!(url = %url, "401 without a usable challenge");
            return Ok(response);
        };
        let auth = self.authorize(challenge, scope).await?;
        self.auth.insert(scope.to_string(), auth.clone());

        Ok(self
            .request(method, url, accept, Some(&auth))
            .send()
            .await?)
    }

    async fn authorize(
        &self,
        challenge: BearerChallenge,
        scope: &str,
    ) -> Result<Authorization, RegistryError> {
        if challenge.scheme == AuthScheme::Basic {
            return Ok(Authorization::Basic);
        }

        let challenge = if challenge.realm.is_some() {
            challenge
        } else {
            self.discover_realm(challenge).await?
        };
        let realm = challenge
            .realm
            .ok_or_else(|| RegistryError::Challenge("no realm advertised".to_string()))?;

        // The requested scope wins over the challenge's; delete needs more
        // than registries advertise on the manifest endpoint.
        let mut query = Vec::with_capacity(2);
        if let Some(service) = challenge.service.as_deref() {
            query.push(("service", service));
        }
        query.push(("scope", scope));

        let response = self
            .client
            .get(&realm)
            .query(&query)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Token {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(Authorization::Bearer)
            .ok_or_else(|| RegistryError::Challenge("token endpoint returned no token".to_string()))
    }

    /// Pings `/v2/` to learn the realm a bare challenge left out
    async fn discover_realm(
        &self,
        challenge: BearerChallenge,
    ) -> Result<BearerChallenge, RegistryError> {
        let url = format!("{}/v2/", self.base);
        let response = self.request(Method::GET, &url, None, None).send().await?;
        let probed = challenge_of(&response);
        debug!(url = %url, found = probed.is_some(), "Probed registry for auth realm");

        Ok(match probed {
            Some(probed) => BearerChallenge {
                realm: probed.realm,
                service: challenge.service.or(probed.service),
                ..challenge
            },
            None => challenge,
        })
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        auth: Option<&Authorization>,
    ) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        match auth {
            Some(Authorization::Bearer(token)) => builder.bearer_auth(token),
            Some(Authorization::Basic) => builder.basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            ),
            None => builder,
        }
    }
}

fn challenge_of(response: &Response) -> Option<BearerChallenge> {
    response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(BearerChallenge::parse)
}
