//! Failures an LDAP operation can raise back to the protocol engine.

use thiserror::Error;

/// LDAP result codes (RFC 4511, section 4.1.9) used by this server.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const AUTH_METHOD_NOT_SUPPORTED: i32 = 7;
    pub const UNAVAILABLE_CRITICAL_EXTENSION: i32 = 12;
    pub const INAPPROPRIATE_AUTHENTICATION: i32 = 48;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LdapError {
    #[error("{0}")]
    InappropriateAuthentication(String),

    #[error("{0}")]
    InvalidCredentials(String),

    #[error("{0}")]
    UnwillingToPerform(String),

    #[error("{0}")]
    AuthMethodNotSupported(String),

    #[error("{0}")]
    UnavailableCriticalExtension(String),

    #[error("{0}")]
    ProtocolError(String),
}

impl LdapError {
    pub fn result_code(&self) -> i32 {
        match self {
            LdapError::InappropriateAuthentication(_) => result_code::INAPPROPRIATE_AUTHENTICATION,
            LdapError::InvalidCredentials(_) => result_code::INVALID_CREDENTIALS,
            LdapError::UnwillingToPerform(_) => result_code::UNWILLING_TO_PERFORM,
            LdapError::AuthMethodNotSupported(_) => result_code::AUTH_METHOD_NOT_SUPPORTED,
            LdapError::UnavailableCriticalExtension(_) => result_code::UNAVAILABLE_CRITICAL_EXTENSION,
            LdapError::ProtocolError(_) => result_code::PROTOCOL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(LdapError::InappropriateAuthentication(String::new()).result_code(), 48);
        assert_eq!(LdapError::InvalidCredentials(String::new()).result_code(), 49);
        assert_eq!(LdapError::UnwillingToPerform(String::new()).result_code(), 53);
        assert_eq!(LdapError::AuthMethodNotSupported(String::new()).result_code(), 7);
        assert_eq!(LdapError::UnavailableCriticalExtension(String::new()).result_code(), 12);
        assert_eq!(LdapError::ProtocolError(String::new()).result_code(), 2);
    }

    #[test]
    fn test_display_is_diagnostic_message() {
        let err = LdapError::InvalidCredentials("Invalid credentials".to_string());
        assert_eq!(err.to_string(), "Invalid credentials");
    }
}
