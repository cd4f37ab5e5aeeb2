//! Plain HTTP(S) downloads.
//!
//! The digest is the SHA-256 of the bytes exactly as served; archive
//! wrappers are stripped afterwards.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use super::{FetchContext, ModuleSource, Payload, Resolved, USER_AGENT_VALUE};
use crate::digest::sha256_hex;
use crate::error::{CacheError, CacheResult};
use crate::validate::unbox;

/// Downloads modules with a single GET.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    max_retries: u32,
}

/// Failed attempt, and whether another attempt could succeed.
enum Attempt {
    Transient(CacheError),
    Fatal(CacheError),
}

impl HttpSource {
    pub fn new(max_retries: u32) -> CacheResult<Self> {
        let client = build_client()?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
        }
    }

    async fn download(&self, url: &str, timeout: Duration) -> CacheResult<Vec<u8>> {
        use rand::Rng;

        let mut retries = 0;

        loop {
            match self.download_once(url, timeout).await {
                Ok(bytes) => return Ok(bytes),
                Err(Attempt::Transient(e)) if retries < self.max_retries => {
                    retries += 1;

                    let base_backoff = Duration::from_millis(250 << retries.min(7));
                    let base_backoff = base_backoff.min(Duration::from_secs(30));
                    let jittered_ms =
                        rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
                    let backoff = Duration::from_millis(jittered_ms.max(10));

                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying module download"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(Attempt::Transient(e)) | Err(Attempt::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn download_once(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, Attempt> {
        let mut request = self.client.get(url);
        if !timeout.is_zero() {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify(url, timeout, e))?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => {}
            429 | 500..=599 => {
                return Err(Attempt::Transient(CacheError::fetch(
                    url,
                    format!("HTTP {}", status),
                )))
            }
            _ => {
                return Err(Attempt::Fatal(CacheError::fetch(
                    url,
                    format!("HTTP {}", status),
                )))
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify(url, timeout, e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ModuleSource for HttpSource {
    async fn resolve(&self, url: &str, ctx: &FetchContext) -> CacheResult<Resolved> {
        let raw = self.download(url, ctx.timeout).await?;
        let digest = sha256_hex(&raw);
        debug!(url, digest = %digest, size = raw.len(), "downloaded module");

        Ok(Resolved {
            digest,
            payload: Payload::Ready(unbox(raw)),
        })
    }
}

fn classify(url: &str, timeout: Duration, err: reqwest::Error) -> Attempt {
    if err.is_timeout() {
        return Attempt::Fatal(CacheError::Timeout {
            url: url.to_string(),
            timeout,
        });
    }
    let transient = err.is_connect() || err.is_request() || err.is_body();
    let err = CacheError::fetch(url, err);
    if transient {
        Attempt::Transient(err)
    } else {
        Attempt::Fatal(err)
    }
}

pub(crate) fn build_client() -> CacheResult<reqwest::Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .map_err(|e| CacheError::Config {
            message: format!("failed to create HTTP client: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::tests::{gzip_of, MODULE};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> FetchContext {
        FetchContext {
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_digests_raw_bytes() {
        let mock_server = MockServer::start().await;
        let gz = gzip_of(MODULE);

        Mock::given(method("GET"))
            .and(path("/filter.wasm.gz"))
            .and(header("user-agent", USER_AGENT_VALUE))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gz.clone()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source = HttpSource::new(0).unwrap();
        let url = format!("{}/filter.wasm.gz", mock_server.uri());
        let resolved = source.resolve(&url, &ctx()).await.unwrap();

        assert_eq!(resolved.digest, sha256_hex(&gz));
        assert_eq!(resolved.payload.into_bytes().await.unwrap(), MODULE);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/missing.wasm"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source = HttpSource::new(3).unwrap();
        let url = format!("{}/missing.wasm", mock_server.uri());
        let err = source.resolve(&url, &ctx()).await.unwrap_err();

        assert!(matches!(err, CacheError::Fetch { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_server_error_retried_when_enabled() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flaky.wasm"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/flaky.wasm"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(MODULE))
            .mount(&mock_server)
            .await;

        let source = HttpSource::new(1).unwrap();
        let url = format!("{}/flaky.wasm", mock_server.uri());
        let resolved = source.resolve(&url, &ctx()).await.unwrap();
        assert_eq!(resolved.digest, sha256_hex(MODULE));
    }

    #[tokio::test]
    async fn test_server_error_not_retried_by_default() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flaky.wasm"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let source = HttpSource::new(0).unwrap();
        let url = format!("{}/flaky.wasm", mock_server.uri());
        assert!(source.resolve(&url, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/slow.wasm"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(MODULE)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let source = HttpSource::new(0).unwrap();
        let url = format!("{}/slow.wasm", mock_server.uri());
        let ctx = FetchContext {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let err = source.resolve(&url, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Timeout { timeout, .. } if timeout == Duration::from_millis(100)
        ));
    }
}
