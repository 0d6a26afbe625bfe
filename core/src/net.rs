use std::collections::HashMap;
use std::io::Read;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE, REFERER,
};
use reqwest::redirect::Policy;

use crate::config::ProxyConfig;
use crate::error::{classify_reqwest_error, DownloadError, ErrorCategory};
use crate::types::constants;
use crate::types::{ByteCount, ByteOffset};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
    pub range: Option<(ByteOffset, ByteOffset)>,
    pub referer: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub verify_tls: bool,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: user_agent.into(),
            headers: HashMap::new(),
            range: None,
            referer: None,
            proxy: None,
            verify_tls: true,
        }
    }

    pub fn with_range(mut self, start: ByteOffset, end: ByteOffset) -> Self {
        self.range = Some((start, end));
        self
    }
}

/// Headers inspected by the capability probe.
#[derive(Debug, Clone, Default)]
pub struct HeadResponse {
    pub status: u16,
    pub content_length: Option<ByteCount>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_encoding: Option<String>,
    pub final_url: String,
}

/// A streaming GET body. The reader blocks inside the HTTP client while
/// awaiting bytes; dropping it aborts the transfer.
pub struct BodyResponse {
    pub status: u16,
    pub content_length: Option<ByteCount>,
    pub body: Box<dyn Read + Send>,
}

pub trait HttpClient: Send + Sync {
    fn head(&self, req: &HttpRequest) -> Result<HeadResponse, DownloadError>;
    fn get(&self, req: &HttpRequest) -> Result<BodyResponse, DownloadError>;
}

pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str, verify_tls: bool) -> Result<Self, DownloadError> {
        let client = Self::build_client(user_agent, verify_tls, None)?;
        Ok(Self { client })
    }

    fn build_client(
        user_agent: &str,
        verify_tls: bool,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Client, DownloadError> {
        let mut builder = Client::builder()
            .user_agent(user_agent)
            // DNS resolution has no dedicated timeout here; it runs inside
            // the connect phase and is bounded by CONNECT_TIMEOUT, not the
            // tighter DNS_TIMEOUT the constants table records
            .connect_timeout(constants::CONNECT_TIMEOUT)
            .read_timeout(constants::READ_TIMEOUT)
            .redirect(Policy::limited(constants::MAX_REDIRECTS))
            .danger_accept_invalid_certs(!verify_tls);
        if let Some(proxy) = proxy {
            let mut p = reqwest::Proxy::all(&proxy.url)
                .map_err(|err| DownloadError::network(err.to_string()))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p);
        }
        builder
            .build()
            .map_err(|err| DownloadError::network(err.to_string()))
    }

    fn pick_client(&self, req: &HttpRequest) -> Result<Client, DownloadError> {
        if req.proxy.is_some() || !req.verify_tls {
            Self::build_client(&req.user_agent, req.verify_tls, req.proxy.as_ref())
        } else {
            Ok(self.client.clone())
        }
    }

    fn request_headers(&self, req: &HttpRequest) -> Result<HeaderMap, DownloadError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| DownloadError::network(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| DownloadError::network(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some(referer) = &req.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer)
                    .map_err(|err| DownloadError::network(err.to_string()))?,
            );
        }
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value)
                    .map_err(|err| DownloadError::network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl HttpClient for ReqwestHttpClient {
    fn head(&self, req: &HttpRequest) -> Result<HeadResponse, DownloadError> {
        let client = self.pick_client(req)?;
        let resp = client
            .head(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers = resp.headers();
        let header_str = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
        };

        Ok(HeadResponse {
            status,
            content_length: headers
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<ByteCount>().ok()),
            accept_ranges: headers
                .get(ACCEPT_RANGES)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            content_type: header_str(&CONTENT_TYPE),
            content_disposition: header_str(&CONTENT_DISPOSITION),
            etag: header_str(&ETAG),
            last_modified: header_str(&LAST_MODIFIED),
            content_encoding: header_str(&CONTENT_ENCODING),
            final_url,
        })
    }

    fn get(&self, req: &HttpRequest) -> Result<BodyResponse, DownloadError> {
        let client = self.pick_client(req)?;
        let resp = client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status().as_u16();
        let content_length = resp.content_length().map(|len| len as ByteCount);
        Ok(BodyResponse {
            status,
            content_length,
            body: Box::new(resp),
        })
    }
}

/// Classify a failed read from a streaming body.
pub fn classify_read_error(err: &std::io::Error) -> DownloadError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            DownloadError::new(ErrorCategory::Timeout, "read timed out")
                .with_details(err.to_string())
        }
        _ => DownloadError::network("connection interrupted").with_details(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_request_carries_header() {
        let req = HttpRequest::new("http://example.com/f", "parget/test").with_range(100, 199);
        let client = ReqwestHttpClient::new("parget/test", true).unwrap();
        let headers = client.request_headers(&req).unwrap();
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=100-199");
    }

    #[test]
    fn referer_is_optional() {
        let mut req = HttpRequest::new("http://example.com/f", "parget/test");
        let client = ReqwestHttpClient::new("parget/test", true).unwrap();
        assert!(client.request_headers(&req).unwrap().get(REFERER).is_none());
        req.referer = Some("http://example.com/page".to_string());
        assert_eq!(
            client.request_headers(&req).unwrap().get(REFERER).unwrap(),
            "http://example.com/page"
        );
    }

    #[test]
    fn read_timeouts_classify_as_timeout() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled");
        assert_eq!(classify_read_error(&err).category, ErrorCategory::Timeout);
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(classify_read_error(&err).category, ErrorCategory::Network);
    }
}
