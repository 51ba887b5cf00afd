use crate::StoreError;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on waiting for response headers. The body is not bounded so
/// large tarballs can stream at any pace.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Public registry consulted for tarballs missing from the bucket.
///
/// Tarballs are fetched from `<base>/<package>/-/<file>`, the layout npm-style
/// registries serve. Requests are blocking; callers run them off the async
/// executor.
pub struct FallbackRegistry {
    base_url: String,
    agent: ureq::Agent,
}

/// An open fallback response.
pub struct FallbackBody {
    content_length: Option<u64>,
    reader: ureq::BodyReader<'static>,
}

impl FallbackBody {
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

impl Read for FallbackBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl FallbackRegistry {
    /// `None` when `base_url` is empty, which disables the fallback.
    pub fn new(base_url: &str) -> Option<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return None;
        }
        Some(Self {
            base_url: base_url.to_owned(),
            agent: ureq::Agent::config_builder()
                .timeout_connect(Some(CONNECT_TIMEOUT))
                .timeout_recv_response(Some(RESPONSE_TIMEOUT))
                .build()
                .into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tarball_url(&self, package: &str, file: &str) -> String {
        format!("{}/{package}/-/{file}", self.base_url)
    }

    /// Start downloading `file` of `package`. Blocks until headers arrive.
    pub fn fetch(&self, package: &str, file: &str) -> Result<FallbackBody, StoreError> {
        let url = self.tarball_url(package, file);
        debug!("GET {url}");
        let resp = match self.agent.get(&url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                debug!("{url} not found on fallback registry");
                return Err(StoreError::not_found());
            }
            Err(ureq::Error::StatusCode(code)) => {
                warn!("fallback registry answered {code} for {url}");
                return Err(StoreError::Generic {
                    status: code,
                    message: format!("HTTP {code} for {url}"),
                });
            }
            Err(e) => {
                warn!("fallback request to {url} failed: {e}");
                return Err(StoreError::internal(e.to_string()));
            }
        };

        let content_length = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        debug!("fallback {url} opened, content-length {content_length:?}");
        Ok(FallbackBody {
            content_length,
            reader: resp.into_body().into_reader(),
        })
    }
}

impl std::fmt::Debug for FallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackRegistry")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
