//! Acting user resolution

use axum::{extract::FromRequestParts, http::request::Parts};

use flagkit_core::{UserId, ANONYMOUS};

use crate::http::ApiError;

/// Header carrying the acting user's id, set by the fronting host.
pub const USER_HEADER: &str = "x-user-id";

/// The user a request acts as. Requests without the header are anonymous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActingUser(pub UserId);

impl ActingUser {
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }
}

/// Parse the header value; absent means anonymous.
pub fn parse_user_header(value: Option<&str>) -> Result<UserId, ApiError> {
    match value.map(str::trim) {
        None | Some("") => Ok(ANONYMOUS),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid {} header: '{}'", USER_HEADER, raw))),
    }
}

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = match parts.headers.get(USER_HEADER) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| ApiError::BadRequest(format!("{} must be ASCII", USER_HEADER)))?,
            ),
            None => None,
        };
        parse_user_header(header).map(ActingUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_header() {
        assert_eq!(parse_user_header(None).unwrap(), ANONYMOUS);
        assert_eq!(parse_user_header(Some("")).unwrap(), ANONYMOUS);
        assert_eq!(parse_user_header(Some(" 42 ")).unwrap(), 42);
        assert!(parse_user_header(Some("alice")).is_err());
        assert!(parse_user_header(Some("-1")).is_err());
    }

    #[test]
    fn test_anonymous() {
        assert!(ActingUser(ANONYMOUS).is_anonymous());
        assert!(!ActingUser(7).is_anonymous());
    }
}
