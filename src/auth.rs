//! Bearer-token authentication for the HTTP transport.

/// Validates `Authorization: Bearer <token>` headers with a case-sensitive
/// byte compare against the configured token.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// An absent header, a non-Bearer scheme, and an empty token all fail.
    pub fn is_authorized(&self, header: Option<&str>) -> bool {
        let Some(header) = header else {
            return false;
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return false;
        };
        !token.is_empty() && token == self.token
    }
}
