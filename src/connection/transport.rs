use std::{fmt, io};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::gateway::GatewayAddress;

/// A bidirectional byte stream to a gateway.
pub trait GatewayStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> GatewayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`GatewayStream`].
pub type BoxGatewayStream = Box<dyn GatewayStream>;

/// Opens streams to gateways.
pub trait GatewayTransport: Send + Sync + 'static {
    /// Connects to `address`.
    fn connect(&self, address: GatewayAddress) -> BoxFuture<'_, io::Result<BoxGatewayStream>>;
}

/// Connects over TCP with Nagle's algorithm disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl GatewayTransport for TcpTransport {
    fn connect(&self, address: GatewayAddress) -> BoxFuture<'_, io::Result<BoxGatewayStream>> {
        async move {
            let stream = TcpStream::connect(address.endpoint()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxGatewayStream)
        }
        .boxed()
    }
}

impl fmt::Debug for dyn GatewayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GatewayTransport")
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_tcp_transport_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = GatewayAddress::new(listener.local_addr().unwrap());

        let (accepted, connected) =
            tokio::join!(listener.accept(), TcpTransport.connect(address));
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }
}
