//! Connection preamble
//!
//! Before any frame flows on a new connection the client identifies itself with `[i32 idLength][id bytes]`. The id is
//! the encoded client [`GrainId`]. A length of zero marks a direct connection from a silo rather than a client.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::{
    error::{GatewayError, Result},
    framing::WireWrite,
    message::GrainId,
};

const PREAMBLE_MAX_SIZE: usize = 1024;
const PREAMBLE_TIMEOUT_MS: u64 = 3_000;

/// Who opened a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preamble {
    /// A client with this identity.
    Client(GrainId),
    /// A silo connecting directly.
    DirectSilo,
}

async fn read_exact_with_timeout<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match timeout(
        Duration::from_millis(PREAMBLE_TIMEOUT_MS),
        reader.read_exact(buf),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => Err(
            GatewayError::HandshakeFailed("unexpected EOF during preamble".to_string()),
        ),
        Ok(Err(err)) => Err(GatewayError::Network(err)),
        Err(_) => Err(GatewayError::Timeout),
    }
}

/// Sends the preamble identifying `preamble`.
pub async fn write_preamble<W>(stream: &mut W, preamble: &Preamble) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut id = Vec::new();
    if let Preamble::Client(client_id) = preamble {
        client_id.encode(&mut id);
    }
    let mut out = Vec::with_capacity(4 + id.len());
    out.write_len_prefixed(&id);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the preamble sent by the other side of a new connection.
pub async fn read_preamble<R>(reader: &mut R) -> Result<Preamble>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    read_exact_with_timeout(reader, &mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);

    let len = match usize::try_from(len) {
        Ok(0) => return Ok(Preamble::DirectSilo),
        Ok(len) if len <= PREAMBLE_MAX_SIZE => len,
        _ => {
            return Err(GatewayError::HandshakeFailed(format!(
                "invalid preamble size: {len} bytes"
            )))
        }
    };

    let mut buf = vec![0u8; len];
    read_exact_with_timeout(reader, &mut buf).await?;
    let client_id = GrainId::decode(&mut buf.as_slice())
        .map_err(|err| GatewayError::HandshakeFailed(format!("invalid client id: {err}")))?;
    debug!(client = %client_id, "read connection preamble");
    Ok(Preamble::Client(client_id))
}
