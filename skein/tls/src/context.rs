use skein_error::{Error, ErrorKind, Result};
use skein_stack::{ParamStack, Params};
use std::fmt;
use std::io::{BufReader, Cursor};
use std::sync::Arc;

/// Where a piece of certificate material comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Source {
    File,
    Buffer,
}

/// One piece of PEM material: its source kind and the path or bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Material {
    pub source: Source,
    pub value: String,
}

// === impl Material ===

impl Material {
    fn resolve(params: &Params, name: &str) -> Result<Self> {
        let source = match skein_stack::required(params, &format!("{}_src", name))? {
            "file" => Source::File,
            "buffer" => Source::Buffer,
            _ => return Err(Error::new(ErrorKind::InvalidArgument)),
        };
        let key = match source {
            Source::File => format!("{}_file", name),
            Source::Buffer => format!("{}_buffer", name),
        };
        let value = skein_stack::required(params, &key)?.to_string();
        Ok(Self { source, value })
    }

    fn write_params(&self, params: &mut Params, name: &str) {
        let (src, key) = match self.source {
            Source::File => ("file", format!("{}_file", name)),
            Source::Buffer => ("buffer", format!("{}_buffer", name)),
        };
        params.insert(format!("{}_src", name), src.to_string());
        params.insert(key, self.value.clone());
    }

    /// The raw PEM bytes, read from disk for file sources.
    pub fn pem(&self) -> Result<Vec<u8>> {
        match self.source {
            Source::Buffer => Ok(self.value.as_bytes().to_vec()),
            Source::File => std::fs::read(&self.value)
                .map_err(|e| Error::with_source(ErrorKind::BadAddress, e)),
        }
    }
}

/// The comparable half of a TLS endpoint context: the configuration
/// material, not the parsed engine state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlsParams {
    pub ca: Material,
    pub crt: Material,
    pub key: Material,
    pub dhparam: Material,
    /// Expected peer name presented and verified on connect.
    pub name: Option<String>,
    /// Optional cipher-suite allow list, by rustls suite name.
    pub cipher_suites: Option<String>,
}

// === impl TlsParams ===

impl TlsParams {
    pub fn resolve(params: &mut ParamStack, layer: &str) -> Result<Self> {
        let map = params.pop_layer(layer)?;
        Ok(Self {
            ca: Material::resolve(&map, "ca")?,
            crt: Material::resolve(&map, "crt")?,
            key: Material::resolve(&map, "key")?,
            dhparam: Material::resolve(&map, "dhparam")?,
            name: map.get("name").cloned(),
            cipher_suites: map.get("cipher_suites").cloned(),
        })
    }

    pub fn params(&self, layer: &str) -> Params {
        let mut map = Params::new();
        map.insert("layer".into(), layer.into());
        self.ca.write_params(&mut map, "ca");
        self.crt.write_params(&mut map, "crt");
        self.key.write_params(&mut map, "key");
        self.dhparam.write_params(&mut map, "dhparam");
        if let Some(ref name) = self.name {
            map.insert("name".into(), name.clone());
        }
        if let Some(ref suites) = self.cipher_suites {
            map.insert("cipher_suites".into(), suites.clone());
        }
        map
    }
}

/// A TLS endpoint context: the source material plus the engine configs
/// assembled from it. Equality and ordering consider the material only.
#[derive(Clone)]
pub struct TlsContext {
    params: TlsParams,
    client: Arc<rustls::ClientConfig>,
    server: Arc<rustls::ServerConfig>,
}

// === impl TlsContext ===

impl TlsContext {
    /// Assembles both engine configs: mutual authentication with our
    /// certificate/key, peers verified against the supplied CA.
    ///
    /// dhparam material is carried for endpoint identity but unused: the
    /// engine has no DHE suites.
    pub fn assemble(params: TlsParams) -> Result<Self> {
        let ca_pem = params.ca.pem()?;
        let crt_pem = params.crt.pem()?;
        let key_pem = params.key.pem()?;

        let certs = read_certs(&crt_pem)?;
        let key = read_key(&key_pem)?;
        let mut roots = rustls::RootCertStore::empty();
        let (added, _) = roots
            .add_pem_file(&mut BufReader::new(Cursor::new(&ca_pem)))
            .map_err(|_| Error::new(ErrorKind::BadAddress))?;
        if added == 0 {
            return Err(Error::new(ErrorKind::BadAddress));
        }

        let mut client = rustls::ClientConfig::new();
        client.root_store = roots.clone();
        client
            .set_single_client_cert(certs.clone(), key.clone())
            .map_err(|e| Error::with_source(ErrorKind::BadAddress, e))?;

        let verifier = rustls::AllowAnyAuthenticatedClient::new(roots);
        let mut server = rustls::ServerConfig::new(verifier);
        server
            .set_single_cert(certs, key)
            .map_err(|e| Error::with_source(ErrorKind::BadAddress, e))?;

        if let Some(ref allow) = params.cipher_suites {
            let suites = select_suites(allow)?;
            client.ciphersuites = suites.clone();
            server.ciphersuites = suites;
        }

        Ok(Self {
            params,
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn params(&self) -> &TlsParams {
        &self.params
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client.clone()
    }

    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.server.clone()
    }

    /// The DNS name the client expects the server to present.
    pub fn peer_name(&self) -> Result<webpki::DNSNameRef<'_>> {
        let name = self
            .params
            .name
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::BadAddress))?;
        webpki::DNSNameRef::try_from_ascii_str(name)
            .map_err(|_| Error::new(ErrorKind::BadAddress))
    }
}

impl PartialEq for TlsContext {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl Eq for TlsContext {}

impl PartialOrd for TlsContext {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TlsContext {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.params.cmp(&other.params)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("params", &self.params)
            .finish()
    }
}

fn read_certs(pem: &[u8]) -> Result<Vec<rustls::Certificate>> {
    let certs = rustls::internal::pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .map_err(|_| Error::new(ErrorKind::BadAddress))?;
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::BadAddress));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> Result<rustls::PrivateKey> {
    let mut keys =
        rustls::internal::pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(pem)))
            .map_err(|_| Error::new(ErrorKind::BadAddress))?;
    if keys.is_empty() {
        keys = rustls::internal::pemfile::rsa_private_keys(&mut BufReader::new(Cursor::new(pem)))
            .map_err(|_| Error::new(ErrorKind::BadAddress))?;
    }
    keys.pop().ok_or_else(|| Error::new(ErrorKind::BadAddress))
}

fn select_suites(allow: &str) -> Result<Vec<&'static rustls::SupportedCipherSuite>> {
    let mut suites = Vec::new();
    for name in allow.split(':').filter(|s| !s.is_empty()) {
        let suite = rustls::ALL_CIPHERSUITES
            .iter()
            .find(|s| format!("{:?}", s.suite) == name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument))?;
        suites.push(*suite);
    }
    if suites.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument));
    }
    Ok(suites)
}
