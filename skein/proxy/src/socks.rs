use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_physical::HostPort;
use skein_stack::{params, Acceptor, Endpoint, ParamStack, Params, Transport};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocksVersion {
    V4,
    V5,
}

/// The SOCKS endpoint context: protocol version and proxy address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocksContext {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

pub type SocksEndpoint<N> = Endpoint<SocksContext, N>;

/// The SOCKS traversal layer: versions 4/4A and 5 (no authentication),
/// CONNECT command only.
#[derive(Clone, Debug)]
pub struct Socks<N> {
    next: N,
}

// === impl SocksContext ===

impl SocksContext {
    fn resolve(params: &mut ParamStack, layer: &str) -> Result<Self> {
        let map = params.pop_layer(layer)?;
        let version = match skein_stack::required(&map, "socks_version")? {
            "4" => SocksVersion::V4,
            "5" => SocksVersion::V5,
            _ => return Err(Error::new(ErrorKind::InvalidArgument)),
        };
        Ok(Self {
            version,
            host: skein_stack::required(&map, "addr")?.to_string(),
            port: skein_stack::required_parsed(&map, "port")?,
        })
    }

    fn params(&self, layer: &str) -> Params {
        let version = match self.version {
            SocksVersion::V4 => "4",
            SocksVersion::V5 => "5",
        };
        params![
            "layer" => layer,
            "socks_version" => version,
            "addr" => self.host,
            "port" => self.port,
        ]
    }
}

// === impl Socks ===

impl<N> Socks<N> {
    pub fn new(next: N) -> Self {
        Self { next }
    }
}

impl<N: Transport> Socks<N>
where
    N::Endpoint: HostPort,
{
    fn proxy_endpoint(&self, context: &SocksContext) -> Result<N::Endpoint> {
        let mut stack = ParamStack::new();
        stack.push(params!["addr" => context.host, "port" => context.port]);
        self.next.resolve(&mut stack)
    }
}

#[async_trait]
impl<N: Transport> Transport for Socks<N>
where
    N::Endpoint: HostPort,
{
    const ID: u8 = 2;
    const NAME: &'static str = "socks_proxy";
    const OVERHEAD: usize = 0;

    type Endpoint = SocksEndpoint<N::Endpoint>;
    type Io = N::Io;
    type Acceptor = SocksAcceptor<N>;

    fn mtu(&self) -> usize {
        self.next.mtu()
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let context = SocksContext::resolve(params, Self::NAME)?;
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
        let host = endpoint
            .next()
            .host()
            .ok_or_else(|| Error::new(ErrorKind::BadAddress))?
            .to_string();
        let port = endpoint.next().port();

        let proxy = self.proxy_endpoint(context)?;
        let mut io = self.next.connect(&proxy).await?;
        debug!(proxy.host = %context.host, version = ?context.version, "socks connect");
        match context.version {
            SocksVersion::V4 => connect_v4(&mut io, &host, port).await?,
            SocksVersion::V5 => connect_v5(&mut io, &host, port).await?,
        }
        Ok(io)
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        let next = self.next.bind(endpoint.next()).await?;
        Ok(SocksAcceptor {
            next,
            context: endpoint.context().clone(),
        })
    }
}

/// SOCKS4 (and 4A for non-IPv4 hosts): one request, one 8-byte reply.
async fn connect_v4<I: skein_io::Io>(io: &mut I, host: &str, port: u16) -> Result<()> {
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    let hostname = match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        // 4A: an invalid destination ip tells the proxy to resolve the
        // trailing hostname.
        Err(_) => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            Some(host)
        }
    };
    request.push(0); // empty userid
    if let Some(hostname) = hostname {
        request.extend_from_slice(hostname.as_bytes());
        request.push(0);
    }
    io.write_all(&request)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;

    let mut reply = [0u8; 8];
    io.read_exact(&mut reply)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
    if reply[0] != 0 {
        return Err(Error::new(ErrorKind::WrongProtocolType));
    }
    match reply[1] {
        0x5a => {
            trace!("socks4 granted");
            Ok(())
        }
        0x5b => Err(Error::new(ErrorKind::ConnectionRefused)),
        _ => Err(Error::new(ErrorKind::ConnectionAborted)),
    }
}

/// SOCKS5: method negotiation (NO_AUTH only), then CONNECT.
async fn connect_v5<I: skein_io::Io>(io: &mut I, host: &str, port: u16) -> Result<()> {
    io.write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
    let mut method = [0u8; 2];
    io.read_exact(&mut method)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
    if method[0] != 0x05 {
        return Err(Error::new(ErrorKind::WrongProtocolType));
    }
    if method[1] != 0x00 {
        return Err(Error::new(ErrorKind::NoCredentials));
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(Error::new(ErrorKind::BadAddress));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    io.write_all(&request)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;

    let mut head = [0u8; 4];
    io.read_exact(&mut head)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
    if head[0] != 0x05 {
        return Err(Error::new(ErrorKind::WrongProtocolType));
    }
    // Drain the bound address so the tunnel starts clean.
    let bound_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            io.read_exact(&mut len)
                .await
                .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;
            len[0] as usize
        }
        _ => return Err(Error::new(ErrorKind::ProtocolError)),
    };
    let mut bound = vec![0u8; bound_len + 2];
    io.read_exact(&mut bound)
        .await
        .map_err(|e| Error::with_source(ErrorKind::ConnectionAborted, e))?;

    match head[1] {
        0x00 => {
            trace!("socks5 granted");
            Ok(())
        }
        0x05 => Err(Error::new(ErrorKind::ConnectionRefused)),
        _ => Err(Error::new(ErrorKind::ConnectionAborted)),
    }
}

/// The passive side: accepts from the next layer untouched.
pub struct SocksAcceptor<N: Transport> {
    next: N::Acceptor,
    context: SocksContext,
}

// === impl SocksAcceptor ===

#[async_trait]
impl<N: Transport> Acceptor for SocksAcceptor<N>
where
    N::Endpoint: HostPort,
{
    type Io = N::Io;
    type Endpoint = SocksEndpoint<N::Endpoint>;

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
