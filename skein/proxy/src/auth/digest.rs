use md5::{Digest as _, Md5};
use skein_error::{Error, ErrorKind, Result};

/// A parsed RFC 7616 Digest challenge.
#[derive(Clone, Debug, Default)]
pub(crate) struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop_auth: bool,
    nonce_count: u32,
}

// === impl DigestChallenge ===

impl DigestChallenge {
    pub(crate) fn parse(data: &str) -> Result<Self> {
        let mut challenge = Self::default();
        let mut have_nonce = false;
        for (key, value) in split_params(data) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => {
                    challenge.nonce = value;
                    have_nonce = true;
                }
                "opaque" => challenge.opaque = Some(value),
                "qop" => {
                    challenge.qop_auth = value.split(',').any(|q| q.trim() == "auth");
                }
                "algorithm" => {
                    if !value.eq_ignore_ascii_case("md5") {
                        return Err(Error::new(ErrorKind::ProtocolError));
                    }
                }
                _ => {}
            }
        }
        if !have_nonce {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        Ok(challenge)
    }

    /// Computes the `Proxy-Authorization` parameter list for one request.
    pub(crate) fn response(
        &self,
        user: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> Result<String> {
        let ha1 = md5_hex(format!("{}:{}:{}", user, self.realm, password).as_bytes());
        let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
        let nc = self.nonce_count + 1;

        let (response, qop_part) = if self.qop_auth {
            let response = md5_hex(
                format!(
                    "{}:{}:{:08x}:{}:auth:{}",
                    ha1, self.nonce, nc, cnonce, ha2
                )
                .as_bytes(),
            );
            (
                response,
                format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce),
            )
        } else {
            let response = md5_hex(format!("{}:{}:{}", ha1, self.nonce, ha2).as_bytes());
            (response, String::new())
        };

        let mut out = format!(
            "username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"{}",
            user, self.realm, self.nonce, uri, response, qop_part
        );
        if let Some(ref opaque) = self.opaque {
            out.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        Ok(out)
    }
}

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Splits `k1="v1", k2=v2, ...`, honoring quotes.
fn split_params(data: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = data;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.trim_start().strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    value = stripped[..end].to_string();
                    rest = &stripped[end + 1..];
                }
                None => {
                    value = stripped.to_string();
                    rest = "";
                }
            }
        } else {
            match rest.find(',') {
                Some(end) => {
                    value = rest[..end].trim().to_string();
                    rest = &rest[end + 1..];
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        if !key.is_empty() {
            params.push((key, value));
        }
    }
    params
}
