use constant_time_eq::constant_time_eq;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing or invalid admin token")]
pub struct Unauthorized;

/// Bearer-token check against the configured admin secret.
#[derive(Clone)]
pub struct AdminAuth {
    token: String,
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth").finish_non_exhaustive()
    }
}

impl AdminAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// `header` is the raw `Authorization` header value, if any.
    pub fn authorize(&self, header: Option<&str>) -> Result<(), Unauthorized> {
        let presented = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(Unauthorized)?;
        if !self.token.is_empty() && constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(Unauthorized)
        }
    }
}
