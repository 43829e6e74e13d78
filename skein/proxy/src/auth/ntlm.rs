//! NTLM over HTTP: Type 1 (negotiate) and Type 3 (authenticate) message
//! construction with NTLMv2 responses. The server's Type 2 challenge
//! bytes are consumed verbatim.

use super::Credentials;
use hmac::{Hmac, Mac, NewMac};
use md4::{Digest as _, Md4};
use md5::Md5;
use rand::RngCore;
use skein_error::{Error, ErrorKind, Result};
use std::convert::TryInto;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

#[derive(Debug, PartialEq, Eq)]
enum Stage {
    Initial,
    Negotiated,
    Done,
}

/// One NTLM exchange: negotiate, then authenticate against the server's
/// challenge. The underlying connection must stay open across the rounds.
#[derive(Debug)]
pub(crate) struct NtlmRound {
    stage: Stage,
    client_challenge: [u8; 8],
}

// === impl NtlmRound ===

impl NtlmRound {
    pub(crate) fn start() -> Self {
        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_challenge);
        Self {
            stage: Stage::Initial,
            client_challenge,
        }
    }

    /// The Type 1 message.
    pub(crate) fn negotiate_message(&mut self, credentials: &Credentials) -> Result<Vec<u8>> {
        credentials.user_password()?;
        if self.stage != Stage::Initial {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        self.stage = Stage::Negotiated;

        let mut msg = Vec::with_capacity(32);
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        // Empty domain and workstation fields.
        msg.extend_from_slice(&[0u8; 16]);
        Ok(msg)
    }

    /// The Type 3 message, from the server's Type 2 challenge bytes.
    pub(crate) fn authenticate_message(
        &mut self,
        credentials: &Credentials,
        type2: &[u8],
    ) -> Result<Vec<u8>> {
        if self.stage != Stage::Negotiated {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        self.stage = Stage::Done;

        let (user, password) = credentials.user_password()?;
        let domain = credentials.domain.as_deref().unwrap_or("");
        let challenge = Type2::parse(type2)?;

        let hash = ntlmv2_hash(user, domain, password);
        let time = filetime_now();
        let temp = build_temp(time, &self.client_challenge, &challenge.target_info);
        let nt_proof = nt_proof(&hash, &challenge.server_challenge, &temp);

        let mut nt_response = Vec::with_capacity(16 + temp.len());
        nt_response.extend_from_slice(&nt_proof);
        nt_response.extend_from_slice(&temp);

        let mut lm_response = Vec::with_capacity(24);
        let mut lm_input = Vec::with_capacity(16);
        lm_input.extend_from_slice(&challenge.server_challenge);
        lm_input.extend_from_slice(&self.client_challenge);
        lm_response.extend_from_slice(&hmac_md5(&hash, &lm_input));
        lm_response.extend_from_slice(&self.client_challenge);

        let domain_utf16 = utf16le(domain);
        let user_utf16 = utf16le(user);
        let workstation = Vec::new();

        // Header: signature, type, six payload field descriptors, flags.
        const HEADER_LEN: usize = 64;
        let mut msg = Vec::with_capacity(
            HEADER_LEN
                + domain_utf16.len()
                + user_utf16.len()
                + lm_response.len()
                + nt_response.len(),
        );
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());

        // Descriptor order: LM, NT, domain, user, workstation, session
        // key. Payload is emitted in the same order so offsets stay
        // honest.
        let session_key = Vec::new();
        let mut offset = HEADER_LEN;
        let mut fields = Vec::with_capacity(6 * 8);
        let mut payload = Vec::new();
        for part in &[
            &lm_response,
            &nt_response,
            &domain_utf16,
            &user_utf16,
            &workstation,
            &session_key,
        ] {
            fields.extend_from_slice(&(part.len() as u16).to_le_bytes());
            fields.extend_from_slice(&(part.len() as u16).to_le_bytes());
            fields.extend_from_slice(&(offset as u32).to_le_bytes());
            payload.extend_from_slice(part);
            offset += part.len();
        }
        msg.extend_from_slice(&fields);
        msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        msg.extend_from_slice(&payload);
        Ok(msg)
    }
}

struct Type2 {
    server_challenge: [u8; 8],
    target_info: Vec<u8>,
}

// === impl Type2 ===

impl Type2 {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 48 || &data[..8] != SIGNATURE {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        let msg_type = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));
        if msg_type != 2 {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        let server_challenge: [u8; 8] = data[24..32].try_into().expect("8 bytes");

        let info_len = u16::from_le_bytes(data[40..42].try_into().expect("2 bytes")) as usize;
        let info_offset = u32::from_le_bytes(data[44..48].try_into().expect("4 bytes")) as usize;
        if info_offset + info_len > data.len() {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        Ok(Self {
            server_challenge,
            target_info: data[info_offset..info_offset + info_len].to_vec(),
        })
    }
}

pub(crate) fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `NTOWFv1`: MD4 of the UTF-16LE password.
pub(crate) fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(&utf16le(password)).into()
}

/// `NTOWFv2`: HMAC-MD5 of uppercased user + domain, keyed by the NT hash.
pub(crate) fn ntlmv2_hash(user: &str, domain: &str, password: &str) -> [u8; 16] {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &identity)
}

/// The `temp` blob of the NTLMv2 response.
pub(crate) fn build_temp(time: u64, client_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut temp = Vec::with_capacity(28 + target_info.len() + 4);
    temp.push(1); // Responserversion
    temp.push(1); // HiResponserversion
    temp.extend_from_slice(&[0u8; 6]);
    temp.extend_from_slice(&time.to_le_bytes());
    temp.extend_from_slice(client_challenge);
    temp.extend_from_slice(&[0u8; 4]);
    temp.extend_from_slice(target_info);
    temp.extend_from_slice(&[0u8; 4]);
    temp
}

pub(crate) fn nt_proof(hash: &[u8; 16], server_challenge: &[u8; 8], temp: &[u8]) -> [u8; 16] {
    let mut input = Vec::with_capacity(8 + temp.len());
    input.extend_from_slice(server_challenge);
    input.extend_from_slice(temp);
    hmac_md5(hash, &input)
}

/// Windows FILETIME: 100ns ticks since 1601-01-01.
fn filetime_now() -> u64 {
    const UNIX_TO_FILETIME_SECS: u64 = 11_644_473_600;
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (unix.as_secs() + UNIX_TO_FILETIME_SECS) * 10_000_000 + u64::from(unix.subsec_nanos()) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    // Known-answer vectors from MS-NLMP §4.2: User/Domain/Password.

    #[test]
    fn ntowfv2_known_answer() {
        let hash = ntlmv2_hash("User", "Domain", "Password");
        assert_eq!(hex(&hash), "0c868a403bfd7a93a3001ef22ef02e3f");
    }

    #[test]
    fn ntlmv2_proof_known_answer() {
        let hash = ntlmv2_hash("User", "Domain", "Password");
        let server_challenge = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
        let client_challenge = [0xaa; 8];
        // AV pairs: NetBIOS domain "Domain", NetBIOS computer "Server".
        let target_info: Vec<u8> = vec![
            0x02, 0x00, 0x0c, 0x00, 0x44, 0x00, 0x6f, 0x00, 0x6d, 0x00, 0x61, 0x00, 0x69, 0x00,
            0x6e, 0x00, 0x01, 0x00, 0x0c, 0x00, 0x53, 0x00, 0x65, 0x00, 0x72, 0x00, 0x76, 0x00,
            0x65, 0x00, 0x72, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let temp = build_temp(0, &client_challenge, &target_info);
        let proof = nt_proof(&hash, &server_challenge, &temp);
        assert_eq!(hex(&proof), "68cd0ab851e51c96aabc927bebef6a1c");
    }

    #[test]
    fn negotiate_message_shape() {
        let creds = Credentials {
            username: Some("User".into()),
            domain: Some("Domain".into()),
            password: Some("Password".into()),
        };
        let mut round = NtlmRound::start();
        let msg = round.negotiate_message(&creds).expect("type1");
        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
        assert_eq!(msg.len(), 32);
        // A second negotiate on the same round is a protocol error.
        assert!(round
            .negotiate_message(&creds)
            .expect_err("one shot")
            .is(ErrorKind::ProtocolError));
    }

    #[test]
    fn authenticate_round_trip_against_synthetic_challenge() {
        let creds = Credentials {
            username: Some("User".into()),
            domain: Some("Domain".into()),
            password: Some("Password".into()),
        };
        let mut round = NtlmRound::start();
        round.negotiate_message(&creds).expect("type1");

        // A minimal Type 2: header, empty target name, flags, challenge,
        // reserved, empty target info at offset 48.
        let mut type2 = Vec::new();
        type2.extend_from_slice(SIGNATURE);
        type2.extend_from_slice(&2u32.to_le_bytes());
        type2.extend_from_slice(&[0u8; 8]); // target name fields
        type2.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        type2.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
        type2.extend_from_slice(&[0u8; 8]); // reserved
        type2.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]); // target info fields
        assert_eq!(type2.len(), 48);

        let msg = round
            .authenticate_message(&creds, &type2)
            .expect("type3");
        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);
        // The NT response descriptor: 16-byte proof + 28-byte temp + 4.
        let nt_len = u16::from_le_bytes(msg[20..22].try_into().unwrap()) as usize;
        assert_eq!(nt_len, 16 + 32);
        let user_off = u32::from_le_bytes(msg[40..44].try_into().unwrap()) as usize;
        let user_len = u16::from_le_bytes(msg[36..38].try_into().unwrap()) as usize;
        assert_eq!(&msg[user_off..user_off + user_len], &utf16le("User")[..]);
    }

    #[test]
    fn truncated_challenge_is_protocol_error() {
        let creds = Credentials {
            username: Some("u".into()),
            domain: None,
            password: Some("p".into()),
        };
        let mut round = NtlmRound::start();
        round.negotiate_message(&creds).expect("type1");
        assert!(round
            .authenticate_message(&creds, b"NTLMSSP\0\x02")
            .expect_err("short")
            .is(ErrorKind::ProtocolError));
    }
}
