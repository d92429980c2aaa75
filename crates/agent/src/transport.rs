//! §4.1 transport kinds: `vsock://`, hybrid vsock over an `AF_UNIX` socket,
//! and a `remote://` tunnel through a host-side hypervisor proxy socket.
use crate::error::AgentError;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;
use tokio_vsock::{VsockAddr, VsockStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// `vsock://<context_id>:<port>`
    Vsock { cid: u32, port: u32 },
    /// `hvsock://<uds_path>:<port>`: the client writes `CONNECT <port>\n`
    /// once the Unix socket connects, then streams bytes.
    HybridVsock { uds_path: PathBuf, port: u32 },
    /// `remote://<uds_path>`: tunnels through a host-side hypervisor proxy.
    Remote { uds_path: PathBuf },
}

impl Transport {
    pub fn parse(url: &str) -> Result<Self, AgentError> {
        if let Some(rest) = url.strip_prefix("vsock://") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| AgentError::Protocol(format!("malformed vsock url: {url}")))?;
            let cid: u32 = cid
                .parse()
                .map_err(|_| AgentError::Protocol(format!("bad vsock cid in {url}")))?;
            let port: u32 = port
                .parse()
                .map_err(|_| AgentError::Protocol(format!("bad vsock port in {url}")))?;
            return Ok(Transport::Vsock { cid, port });
        }
        if let Some(rest) = url.strip_prefix("hvsock://") {
            let (path, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AgentError::Protocol(format!("malformed hvsock url: {url}")))?;
            let port: u32 = port
                .parse()
                .map_err(|_| AgentError::Protocol(format!("bad hvsock port in {url}")))?;
            return Ok(Transport::HybridVsock {
                uds_path: PathBuf::from(path),
                port,
            });
        }
        if let Some(rest) = url.strip_prefix("remote://") {
            return Ok(Transport::Remote {
                uds_path: PathBuf::from(rest),
            });
        }
        Err(AgentError::Protocol(format!(
            "unrecognized transport url: {url}"
        )))
    }

    /// Formats back to a URL; round-trips with [`Transport::parse`] (§8 S5).
    pub fn to_url(&self) -> String {
        match self {
            Transport::Vsock { cid, port } => format!("vsock://{cid}:{port}"),
            Transport::HybridVsock { uds_path, port } => {
                format!("hvsock://{}:{port}", uds_path.display())
            }
            Transport::Remote { uds_path } => format!("remote://{}", uds_path.display()),
        }
    }

    pub async fn connect(&self) -> Result<Conn, AgentError> {
        match self {
            Transport::Vsock { cid, port } => {
                let addr = VsockAddr::new(*cid, *port);
                let stream = VsockStream::connect(addr)
                    .await
                    .map_err(|e| AgentError::Transport(e.to_string()))?;
                Ok(Conn::Vsock(stream))
            }
            Transport::HybridVsock { uds_path, port } => {
                let mut stream = connect_unix(uds_path).await?;
                let hello = format!("CONNECT {port}\n");
                stream
                    .write_all(hello.as_bytes())
                    .await
                    .map_err(|e| AgentError::Transport(e.to_string()))?;
                Ok(Conn::Unix(stream))
            }
            Transport::Remote { uds_path } => {
                let stream = connect_unix(uds_path).await?;
                Ok(Conn::Unix(stream))
            }
        }
    }
}

async fn connect_unix(path: &Path) -> Result<UnixStream, AgentError> {
    UnixStream::connect(path)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))
}

/// A connected duplex byte stream, regardless of which transport produced it.
pub enum Conn {
    Vsock(VsockStream),
    Unix(UnixStream),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => Pin::new(s).poll_flush(cx),
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Conn {
    pub fn split(
        self,
    ) -> (
        impl AsyncRead + Send + Unpin + 'static,
        impl AsyncWrite + Send + Unpin + 'static,
    ) {
        tokio::io::split(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsock_url_round_trips() {
        let t = Transport::parse("vsock://3:1024").unwrap();
        assert_eq!(t, Transport::Vsock { cid: 3, port: 1024 });
        assert_eq!(t.to_url(), "vsock://3:1024");
    }

    #[test]
    fn hybrid_vsock_url_round_trips() {
        let url = "hvsock:///run/kata/abc.sock:1024";
        let t = Transport::parse(url).unwrap();
        assert_eq!(
            t,
            Transport::HybridVsock {
                uds_path: PathBuf::from("/run/kata/abc.sock"),
                port: 1024,
            }
        );
        assert_eq!(t.to_url(), url);
    }

    #[test]
    fn remote_url_round_trips() {
        let url = "remote:///run/kata/proxy.sock";
        let t = Transport::parse(url).unwrap();
        assert_eq!(t.to_url(), url);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Transport::parse("tcp://127.0.0.1:1").is_err());
    }
}
