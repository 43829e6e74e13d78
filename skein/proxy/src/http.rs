use crate::auth::{self, AuthExchange, Challenge, Credentials, NoCredentials, SecurityContext};
use async_trait::async_trait;
use rand::Rng;
use skein_error::{Error, ErrorKind, Result};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_physical::HostPort;
use skein_stack::{params, Acceptor, Endpoint, ParamStack, Params, Transport};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Response heads larger than this are a framing error.
const MAX_HEAD: usize = 16 * 1024;
/// Authentication rounds beyond this abort the handshake.
const MAX_ROUNDS: usize = 8;

/// The HTTP proxy endpoint context: where the proxy is and how to
/// authenticate against it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpProxyContext {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub reuse_ntlm: bool,
    pub reuse_kerb: bool,
}

pub type HttpProxyEndpoint<N> = Endpoint<HttpProxyContext, N>;

/// The HTTP CONNECT traversal layer. Connects the next layer to the proxy
/// and tunnels to the target named by the endpoint below this layer.
#[derive(Clone)]
pub struct HttpProxy<N> {
    next: N,
    security: Arc<dyn SecurityContext>,
}

// === impl HttpProxyContext ===

impl HttpProxyContext {
    fn resolve(params: &mut ParamStack, layer: &str) -> Result<Self> {
        let map = params.pop_layer(layer)?;
        Ok(Self {
            host: skein_stack::required(&map, "http_host")?.to_string(),
            port: skein_stack::required_parsed(&map, "http_port")?,
            credentials: Credentials {
                username: map.get("http_username").cloned(),
                domain: map.get("http_domain").cloned(),
                password: map.get("http_password").cloned(),
            },
            reuse_ntlm: map.get("http_reuse_ntlm").map(|v| v == "true").unwrap_or(false),
            reuse_kerb: map.get("http_reuse_kerb").map(|v| v == "true").unwrap_or(false),
        })
    }

    fn params(&self, layer: &str) -> Params {
        let mut map = params!["layer" => layer, "http_host" => self.host, "http_port" => self.port];
        if let Some(ref u) = self.credentials.username {
            map.insert("http_username".into(), u.clone());
        }
        if let Some(ref d) = self.credentials.domain {
            map.insert("http_domain".into(), d.clone());
        }
        if let Some(ref p) = self.credentials.password {
            map.insert("http_password".into(), p.clone());
        }
        if self.reuse_ntlm {
            map.insert("http_reuse_ntlm".into(), "true".into());
        }
        if self.reuse_kerb {
            map.insert("http_reuse_kerb".into(), "true".into());
        }
        map
    }
}

// === impl HttpProxy ===

impl<N> HttpProxy<N> {
    pub fn new(next: N) -> Self {
        Self {
            next,
            security: Arc::new(NoCredentials::default()),
        }
    }

    /// Replaces the Negotiate token source.
    pub fn with_security_context(next: N, security: Arc<dyn SecurityContext>) -> Self {
        Self { next, security }
    }
}

impl<N: Transport> HttpProxy<N>
where
    N::Endpoint: HostPort,
{
    /// The next-layer endpoint addressing the proxy itself.
    fn proxy_endpoint(&self, context: &HttpProxyContext) -> Result<N::Endpoint> {
        let mut stack = ParamStack::new();
        stack.push(params!["addr" => context.host, "port" => context.port]);
        self.next.resolve(&mut stack)
    }
}

#[async_trait]
impl<N: Transport> Transport for HttpProxy<N>
where
    N::Endpoint: HostPort,
{
    const ID: u8 = 2;
    const NAME: &'static str = "http_proxy";
    const OVERHEAD: usize = 0;

    type Endpoint = HttpProxyEndpoint<N::Endpoint>;
    type Io = N::Io;
    type Acceptor = ProxyAcceptor<N>;

    fn mtu(&self) -> usize {
        self.next.mtu()
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let context = HttpProxyContext::resolve(params, Self::NAME)?;
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(context, next))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io> {
        let context = endpoint.context();
        let target = format!(
            "{}:{}",
            endpoint
                .next()
                .host()
                .ok_or_else(|| Error::new(ErrorKind::BadAddress))?,
            endpoint.next().port()
        );
        let proxy = self.proxy_endpoint(context)?;
        let mut io = self.next.connect(&proxy).await?;
        debug!(proxy.host = %context.host, %target, "http connect");
        connect_handshake(&mut io, &target, &context.credentials, &self.security).await?;
        Ok(io)
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        // No proxy on the passive side; delegate untouched.
        let next = self.next.bind(endpoint.next()).await?;
        Ok(ProxyAcceptor {
            next,
            context: endpoint.context().clone(),
        })
    }
}

/// Drives CONNECT attempts until the proxy tunnels or refuses.
async fn connect_handshake<I: skein_io::Io>(
    io: &mut I,
    target: &str,
    credentials: &Credentials,
    security: &Arc<dyn SecurityContext>,
) -> Result<()> {
    let mut exchange: Option<AuthExchange> = None;
    let mut challenge_data: Option<String> = None;

    for _round in 0..MAX_ROUNDS {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n",
            target = target
        );
        if let Some(ref mut ex) = exchange {
            let cnonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
            let authorization = ex.authorization(
                credentials,
                security,
                target,
                challenge_data.as_deref(),
                &cnonce,
            )?;
            request.push_str("Proxy-Authorization: ");
            request.push_str(&authorization);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        io.write_all(request.as_bytes())
            .await
            .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;

        let head = read_head(io).await?;
        let reply = ReplyHead::parse(&head)?;
        reply.discard_body(io).await?;
        trace!(status = reply.status, "proxy reply");

        match reply.status {
            200 => return Ok(()),
            407 => {
                let challenges: Vec<Challenge> = reply
                    .headers("proxy-authenticate")
                    .filter_map(|v| auth::parse_challenge(v))
                    .collect();
                let data = challenges
                    .iter()
                    .map(|c| c.data.clone())
                    .find(|d| !d.is_empty());
                let multi_round = exchange.as_ref().map(AuthExchange::is_multi_round);
                match (multi_round, data) {
                    // Mid-exchange: the same scheme answered with token
                    // data keeps the rounds going on this connection.
                    (Some(true), Some(data)) => challenge_data = Some(data),
                    (Some(false), _) => {
                        warn!("proxy rejected credentials");
                        return Err(Error::new(ErrorKind::ConnectionAborted));
                    }
                    // First challenge, or the server restarted a
                    // multi-round negotiation without token data.
                    _ => {
                        let (new_exchange, scheme) =
                            AuthExchange::select(&challenges, credentials, security)?;
                        debug!(%scheme, "proxy requires authentication");
                        exchange = Some(new_exchange);
                        challenge_data = None;
                    }
                }
            }
            status => {
                warn!(status, "proxy refused connect");
                return Err(Error::new(ErrorKind::ConnectionAborted));
            }
        }
    }
    Err(Error::new(ErrorKind::ConnectionAborted))
}

/// Reads the response head through the double CRLF.
async fn read_head<I: skein_io::Io>(io: &mut I) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        let n = io
            .read(&mut byte)
            .await
            .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
        if n == 0 {
            return Err(Error::new(ErrorKind::ConnectionAborted));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))
}

struct ReplyHead {
    status: u16,
    headers: Vec<(String, String)>,
}

// === impl ReplyHead ===

impl ReplyHead {
    fn parse(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().ok_or_else(|| Error::new(ErrorKind::ProtocolError))?;
        if !status_line.starts_with("HTTP/1.") {
            return Err(Error::new(ErrorKind::WrongProtocolType));
        }
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::new(ErrorKind::ProtocolError))?;
        let headers = lines
            .filter(|l| !l.is_empty())
            .filter_map(|l| {
                l.split_once(':')
                    .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            })
            .collect();
        Ok(Self { status, headers })
    }

    fn headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Drains a `Content-Length` body so the next reply starts clean.
    async fn discard_body<I: skein_io::Io>(&self, io: &mut I) -> Result<()> {
        let len: usize = match self.headers("content-length").next() {
            Some(v) => v
                .parse()
                .map_err(|_| Error::new(ErrorKind::ProtocolError))?,
            None => return Ok(()),
        };
        let mut remaining = len;
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let n = io
                .read(&mut buf[..remaining.min(4096)])
                .await
                .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
            if n == 0 {
                return Err(Error::new(ErrorKind::ConnectionAborted));
            }
            remaining -= n;
        }
        Ok(())
    }
}

/// The passive side of the proxy layer: accepts from the next layer
/// untouched.
pub struct ProxyAcceptor<N: Transport> {
    next: N::Acceptor,
    context: HttpProxyContext,
}

// === impl ProxyAcceptor ===

#[async_trait]
impl<N: Transport> Acceptor for ProxyAcceptor<N>
where
    N::Endpoint: HostPort,
{
    type Io = N::Io;
    type Endpoint = HttpProxyEndpoint<N::Endpoint>;

    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)> {
        let (io, peer) = self.next.accept().await?;
        Ok((io, Endpoint::new(self.context.clone(), peer)))
    }

    fn local_endpoint(&self) -> Self::Endpoint {
        Endpoint::new(self.context.clone(), self.next.local_endpoint())
    }

    async fn close(&self) -> Result<()> {
        self.next.close().await
    }
}
