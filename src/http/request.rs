//! Outgoing request type and header helpers.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};

use crate::error::{Error, Result};

const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// Methods accepted by [`Request::from_parts`].
const VALID_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

/// An HTTP request to be sent by a [`Client`](crate::Client).
///
/// The body is buffered so the same request can be dispatched again on
/// every retry attempt.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Ok(Self {
            method,
            url: Url::parse(url)?,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// Creates a request from a method name, URL, headers and optional body.
    ///
    /// The method must be one of the standard HTTP methods, spelled in
    /// upper case.
    pub fn from_parts(
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Self> {
        if !VALID_METHODS.contains(&method) {
            return Err(Error::InvalidMethod(method.to_string()));
        }
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::InvalidMethod(method.to_string()))?;

        let mut request = Self::new(method, url)?;
        for (name, value) in headers {
            request.set_header(name, value)?;
        }
        request.body = body;
        Ok(request)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.set_header(name, value)?;
        Ok(self)
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
        let value = header_value(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Sets `Authorization: Bearer <token>`.
    pub fn set_bearer_token(&mut self, token: &str) -> Result<()> {
        self.set_prefix_token("Bearer", token)
    }

    /// Sets `Authorization: <prefix> <token>`.
    pub fn set_prefix_token(&mut self, prefix: &str, token: &str) -> Result<()> {
        let mut value = header_value(&format!("{} {}", prefix, token))?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Sets the `Idempotency-Key` header on POST and PATCH requests.
    ///
    /// A blank key is replaced by a random UUID v4. Other methods are left
    /// untouched since they are idempotent already.
    pub fn set_idempotency_key(&mut self, key: &str) -> Result<()> {
        if self.method != Method::POST && self.method != Method::PATCH {
            return Ok(());
        }

        let key = match key.trim() {
            "" => uuid::Uuid::new_v4().to_string(),
            key => key.to_string(),
        };
        self.headers.insert(IDEMPOTENCY_KEY, header_value(&key)?);
        Ok(())
    }

    pub fn set_user_agent(&mut self, user_agent: &str) -> Result<()> {
        self.headers.insert(USER_AGENT, header_value(user_agent)?);
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{:?}: {}", value, e)))
}
