use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;

const BASIC_PREFIX: &str = "Basic ";

/// The shared static credential pair every authenticated operation is
/// checked against.
pub struct Credentials {
    user: String,
    pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// Check the `Authorization` header for a matching Basic credential.
    pub fn verify(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(payload) = value.strip_prefix(BASIC_PREFIX) else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(payload) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        match text.split_once(':') {
            Some((user, pass)) => user == self.user && pass == self.pass,
            None => false,
        }
    }

    /// The header value this pair produces, for outbound requests.
    pub fn basic_header(&self) -> String {
        let payload =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.pass));
        format!("{BASIC_PREFIX}{payload}")
    }
}

/// The 401 challenge answered to requests with missing or wrong
/// credentials.
pub fn challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=Restricted")],
        "Unauthorized",
    )
        .into_response()
}
