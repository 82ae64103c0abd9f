//! Secret handling utilities.
//!
//! Re-exports secrecy types and redacts credentials embedded in log
//! connection strings before they are shown to operators.

pub use secrecy::{ExposeSecret, SecretString};

/// Replace the `user:password@` part of a connection string with `***@`.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    match (raw.find("://"), raw.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &raw[..scheme_end + 3], &raw[at..])
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_redacted() {
        let url = SecretString::from("postgres://admin:changeit@db:5432/activity");
        assert_eq!(redact_url(&url), "postgres://***@db:5432/activity");
    }

    #[test]
    fn urls_without_credentials_pass_through() {
        let url = SecretString::from("memory://");
        assert_eq!(redact_url(&url), "memory://");
    }
}
