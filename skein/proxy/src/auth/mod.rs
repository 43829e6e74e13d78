//! Proxy authentication schemes, strongest first: Negotiate, NTLM,
//! Digest, Basic.

mod basic;
mod digest;
mod ntlm;

pub(crate) use self::digest::DigestChallenge;
pub(crate) use self::ntlm::NtlmRound;

use skein_error::{Error, ErrorKind, Result};
use std::fmt;
use std::sync::Arc;

/// Credentials the HTTP layer carries for the proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credentials {
    pub username: Option<String>,
    pub domain: Option<String>,
    pub password: Option<String>,
}

// === impl Credentials ===

impl Credentials {
    pub fn user_password(&self) -> Result<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => Ok((u, p)),
            _ => Err(Error::new(ErrorKind::NoCredentials)),
        }
    }
}

/// A pluggable token source for `Negotiate` (Kerberos/SPNEGO). The
/// platform owns the credentials; this layer only shuttles opaque tokens,
/// presenting each server challenge verbatim.
pub trait SecurityContext: Send + Sync {
    /// The first token, before any server challenge.
    fn initial_token(&self, service: &str) -> Result<Vec<u8>>;

    /// The next token in response to a server challenge.
    fn step(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// The default security context: no platform credentials available.
#[derive(Clone, Debug, Default)]
pub struct NoCredentials(());

impl SecurityContext for NoCredentials {
    fn initial_token(&self, _service: &str) -> Result<Vec<u8>> {
        Err(Error::new(ErrorKind::NoCredentials))
    }

    fn step(&self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::new(ErrorKind::NoCredentials))
    }
}

/// One `Proxy-Authenticate` challenge: the scheme name and whatever
/// followed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub scheme: Scheme,
    pub data: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Scheme {
    Basic,
    Digest,
    Ntlm,
    Negotiate,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Basic => f.pad("Basic"),
            Scheme::Digest => f.pad("Digest"),
            Scheme::Ntlm => f.pad("NTLM"),
            Scheme::Negotiate => f.pad("Negotiate"),
        }
    }
}

/// Parses one `Proxy-Authenticate` header value.
pub(crate) fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, data) = match value.split_once(' ') {
        Some((s, d)) => (s, d.trim().to_string()),
        None => (value, String::new()),
    };
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "basic" => Scheme::Basic,
        "digest" => Scheme::Digest,
        "ntlm" => Scheme::Ntlm,
        "negotiate" => Scheme::Negotiate,
        _ => return None,
    };
    Some(Challenge { scheme, data })
}

/// An in-progress authentication exchange across CONNECT attempts.
#[derive(Debug)]
pub(crate) enum AuthExchange {
    Basic,
    Digest(DigestChallenge),
    Ntlm(NtlmRound),
    Negotiate { service: String },
}

// === impl AuthExchange ===

impl AuthExchange {
    /// Picks the strongest challenge we can actually answer.
    pub(crate) fn select(
        challenges: &[Challenge],
        credentials: &Credentials,
        security: &Arc<dyn SecurityContext>,
    ) -> Result<(Self, Scheme)> {
        let mut best: Option<&Challenge> = None;
        for c in challenges {
            let answerable = match c.scheme {
                Scheme::Basic | Scheme::Digest | Scheme::Ntlm => {
                    credentials.user_password().is_ok()
                }
                Scheme::Negotiate => security.initial_token("HTTP").is_ok(),
            };
            if answerable && best.map(|b| c.scheme > b.scheme).unwrap_or(true) {
                best = Some(c);
            }
        }
        let challenge = best.ok_or_else(|| Error::new(ErrorKind::NoCredentials))?;
        let exchange = match challenge.scheme {
            Scheme::Basic => AuthExchange::Basic,
            Scheme::Digest => AuthExchange::Digest(DigestChallenge::parse(&challenge.data)?),
            Scheme::Ntlm => AuthExchange::Ntlm(NtlmRound::start()),
            Scheme::Negotiate => AuthExchange::Negotiate {
                service: "HTTP".to_string(),
            },
        };
        Ok((exchange, challenge.scheme))
    }

    /// Whether this exchange spans several CONNECT attempts on one
    /// connection.
    pub(crate) fn is_multi_round(&self) -> bool {
        matches!(self, AuthExchange::Ntlm(_) | AuthExchange::Negotiate { .. })
    }

    /// Produces the `Proxy-Authorization` value for the next attempt.
    pub(crate) fn authorization(
        &mut self,
        credentials: &Credentials,
        security: &Arc<dyn SecurityContext>,
        target: &str,
        challenge_data: Option<&str>,
        cnonce: &str,
    ) -> Result<String> {
        match self {
            AuthExchange::Basic => {
                let (user, pass) = credentials.user_password()?;
                Ok(format!("Basic {}", basic::token(user, pass)))
            }
            AuthExchange::Digest(ref challenge) => {
                let (user, pass) = credentials.user_password()?;
                Ok(format!(
                    "Digest {}",
                    challenge.response(user, pass, "CONNECT", target, cnonce)?
                ))
            }
            AuthExchange::Ntlm(round) => {
                let token = match challenge_data {
                    None => round.negotiate_message(credentials)?,
                    Some(data) => {
                        let server = base64::decode(data.trim())
                            .map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))?;
                        round.authenticate_message(credentials, &server)?
                    }
                };
                Ok(format!("NTLM {}", base64::encode(&token)))
            }
            AuthExchange::Negotiate { service } => {
                let token = match challenge_data {
                    None => security.initial_token(service)?,
                    Some(data) => {
                        let server = base64::decode(data.trim())
                            .map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))?;
                        security.step(&server)?
                    }
                };
                Ok(format!("Negotiate {}", base64::encode(&token)))
            }
        }
    }
}
