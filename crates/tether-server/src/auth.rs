//! Controller token validation.

use subtle::ConstantTimeEq;
use tracing::warn;

/// Validates a presented controller token against the configured secret.
#[derive(Debug, Clone)]
pub struct ControllerAuth {
    secret: Option<String>,
}

impl ControllerAuth {
    pub fn new(secret: Option<String>) -> Self {
        if secret.is_none() {
            warn!("no controller token configured — every controller attach will be rejected");
        }
        Self { secret }
    }

    /// Whether `token` grants the controller role.
    ///
    /// Always false when no secret is configured or no token is presented.
    /// The comparison is constant-time for equal-length inputs.
    pub fn validate(&self, token: Option<&str>) -> bool {
        let (Some(secret), Some(token)) = (self.secret.as_deref(), token) else {
            return false;
        };
        if secret.len() != token.len() {
            return false;
        }
        secret.as_bytes().ct_eq(token.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_match() {
        let auth = ControllerAuth::new(Some("s3cret".into()));
        assert!(auth.validate(Some("s3cret")));
    }

    #[test]
    fn rejects_wrong_token() {
        let auth = ControllerAuth::new(Some("s3cret".into()));
        assert!(!auth.validate(Some("S3CRET")));
        assert!(!auth.validate(Some("s3cret ")));
        assert!(!auth.validate(Some("")));
    }

    #[test]
    fn rejects_missing_token() {
        let auth = ControllerAuth::new(Some("s3cret".into()));
        assert!(!auth.validate(None));
    }

    #[test]
    fn rejects_everything_without_secret() {
        let auth = ControllerAuth::new(None);
        assert!(!auth.validate(Some("s3cret")));
        assert!(!auth.validate(Some("")));
        assert!(!auth.validate(None));
    }
}
