//! Registry authentication.
//!
//! Credentials come from a pull secret in Docker config JSON form:
//!
//! ```json
//! {"auths": {"ghcr.io": {"auth": "dXNlcjpwYXNz"}}}
//! ```
//!
//! Registries answer an unauthenticated request with a `401` and a
//! `WWW-Authenticate` challenge. `Basic` challenges are answered with the
//! credentials directly; `Bearer` challenges by exchanging them for a token
//! at the advertised realm.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Username and password for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl Credentials {
    /// Credentials for `registry` from a Docker config JSON pull secret.
    ///
    /// Returns `None` when the secret has no entry for the registry.
    pub fn from_pull_secret(secret: &[u8], registry: &str) -> CacheResult<Option<Self>> {
        let config: DockerConfig = serde_json::from_slice(secret).map_err(|e| {
            CacheError::fetch(registry, format!("invalid pull secret: {}", e))
        })?;

        let wanted = normalize_host(registry);
        let Some(entry) = config
            .auths
            .iter()
            .find(|(key, _)| normalize_host(key) == wanted)
            .map(|(_, entry)| entry)
        else {
            return Ok(None);
        };

        if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD.decode(auth.trim()).map_err(|e| {
                CacheError::fetch(registry, format!("invalid auth in pull secret: {}", e))
            })?;
            let decoded = String::from_utf8(decoded).map_err(|_| {
                CacheError::fetch(registry, "invalid auth in pull secret: not UTF-8")
            })?;
            let Some((username, password)) = decoded.split_once(':') else {
                return Err(CacheError::fetch(
                    registry,
                    "invalid auth in pull secret: expected user:password",
                ));
            };
            return Ok(Some(Self {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }

        match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Ok(Some(Self {
                username: username.clone(),
                password: password.clone(),
            })),
            _ => Ok(None),
        }
    }

    /// `Authorization` header value for basic auth.
    pub fn basic(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

fn normalize_host(key: &str) -> String {
    let key = key.trim();
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key).to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        return DOCKER_HUB_ALIASES[0].to_string();
    }
    host
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(rest);
        Some(Self::Bearer {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// `key="value", key2=value2` parameters; commas inside quotes are kept.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Exchange `credentials` for a bearer token at the challenge realm.
/// Anonymous when `credentials` is `None`.
pub async fn fetch_token(
    client: &reqwest::Client,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> CacheResult<String> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(service) = service {
        params.push(("service", service));
    }
    params.push(("scope", scope));

    let token_url = url::Url::parse_with_params(realm, &params)
        .map_err(|e| CacheError::fetch(realm, format!("invalid token realm: {}", e)))?;

    let mut request = client.get(token_url.as_str());
    if !timeout.is_zero() {
        request = request.timeout(timeout);
    }
    if let Some(credentials) = credentials {
        request = request.header(reqwest::header::AUTHORIZATION, credentials.basic());
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            CacheError::Timeout {
                url: realm.to_string(),
                timeout,
            }
        } else {
            CacheError::fetch(realm, e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::fetch(
            realm,
            format!("token request failed: HTTP {}", status),
        ));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| CacheError::fetch(realm, format!("invalid token response: {}", e)))?;

    debug!(realm, scope, "obtained registry token");

    body.token
        .or(body.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CacheError::fetch(realm, "token response carried no token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_pull_secret_auth_field() {
        let secret = br#"{"auths":{"ghcr.io":{"auth":"dXNlcjpwYXNz"}}}"#;
        let creds = Credentials::from_pull_secret(secret, "ghcr.io")
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "pass");
        assert_eq!(creds.basic(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_pull_secret_username_password() {
        let secret = br#"{"auths":{"https://registry.example.com/v1/":{"username":"u","password":"p:w"}}}"#;
        let creds = Credentials::from_pull_secret(secret, "registry.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(creds.password, "p:w");
    }

    #[test]
    fn test_pull_secret_docker_hub_alias() {
        let secret = br#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#;
        assert!(Credentials::from_pull_secret(secret, "docker.io")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_pull_secret_other_registry() {
        let secret = br#"{"auths":{"ghcr.io":{"auth":"dXNlcjpwYXNz"}}}"#;
        assert!(Credentials::from_pull_secret(secret, "quay.io")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pull_secret_invalid() {
        let err = Credentials::from_pull_secret(b"{nope", "ghcr.io").unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));

        let secret = br#"{"auths":{"ghcr.io":{"auth":"bm9jb2xvbg=="}}}"#;
        assert!(Credentials::from_pull_secret(secret, "ghcr.io").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials {
            username: "u".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/filter:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some("repository:org/filter:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenge() {
        assert_eq!(
            Challenge::parse(r#"Basic realm="registry""#),
            Some(Challenge::Basic)
        );
        assert_eq!(Challenge::parse("Negotiate"), None);
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[tokio::test]
    async fn test_fetch_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry"))
            .and(query_param("scope", "repository:org/filter:pull"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t0k"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let creds = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let token = fetch_token(
            &reqwest::Client::new(),
            &format!("{}/token", mock_server.uri()),
            Some("registry"),
            "repository:org/filter:pull",
            Some(&creds),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(token, "t0k");
    }

    #[tokio::test]
    async fn test_fetch_token_denied() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let err = fetch_token(
            &reqwest::Client::new(),
            &format!("{}/token", mock_server.uri()),
            None,
            "repository:org/filter:pull",
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
