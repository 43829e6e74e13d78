//! Mints a throwaway CA and leaf identities for mutual-TLS tests.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use skein_stack::Params;

pub struct Ca {
    cert: Certificate,
    key: KeyPair,
}

pub struct Identity {
    pub crt_pem: String,
    pub key_pem: String,
}

// === impl Ca ===

impl Ca {
    pub fn new() -> Self {
        let key = KeyPair::generate().expect("generate ca key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key).expect("self-sign ca");
        Self { cert, key }
    }

    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issues a leaf valid for both server and client authentication.
    pub fn issue(&self, name: &str) -> Identity {
        let key = KeyPair::generate().expect("generate leaf key");
        let mut params = CertificateParams::new(vec![name.to_string()]).expect("leaf params");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf");
        Identity {
            crt_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// The full TLS parameter map for an identity issued by this CA.
    pub fn tls_params(&self, identity: &Identity, peer_name: &str) -> Params {
        let mut map = Params::new();
        map.insert("layer".into(), "tls".into());
        map.insert("ca_src".into(), "buffer".into());
        map.insert("ca_buffer".into(), self.ca_pem());
        map.insert("crt_src".into(), "buffer".into());
        map.insert("crt_buffer".into(), identity.crt_pem.clone());
        map.insert("key_src".into(), "buffer".into());
        map.insert("key_buffer".into(), identity.key_pem.clone());
        map.insert("dhparam_src".into(), "buffer".into());
        map.insert("dhparam_buffer".into(), "unused".into());
        map.insert("name".into(), peer_name.into());
        map
    }
}

impl Default for Ca {
    fn default() -> Self {
        Self::new()
    }
}
