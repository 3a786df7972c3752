//! DCE RPC transport layer
//!
//! Connection-oriented DCE RPC runs over a byte stream. PDUs are
//! self-delimiting via the frag_length field in the header, so the
//! transport only needs to read the first ten bytes of a PDU to know how
//! much more to wait for.

use crate::dcerpc::{Pdu, PduHeader};
use crate::error::{Result, RpcError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum PDU size (64 KB default, typical DCE RPC limit)
pub const DEFAULT_MAX_PDU_SIZE: usize = 65536;

/// DCE RPC transport for reading/writing PDUs over a stream
pub struct DceRpcTransport<T> {
    inner: T,
    max_pdu_size: usize,
    read_buf: BytesMut,
}

impl<T> DceRpcTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_pdu_size(mut self, max_size: usize) -> Self {
        self.max_pdu_size = max_size;
        self
    }

    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + Unpin> DceRpcTransport<T> {
    /// Read a complete DCE RPC PDU
    ///
    /// Returns [`RpcError::ConnectionClosed`] on a clean end of stream
    /// between PDUs.
    pub async fn read_pdu(&mut self) -> Result<Bytes> {
        // frag_length sits at offset 8
        while self.read_buf.len() < 10 {
            if self.fill_buf().await? == 0 {
                return Err(self.eof_error("incomplete PDU header"));
            }
        }

        let frag_length = PduHeader::peek_frag_length(&self.read_buf)
            .ok_or_else(|| RpcError::InvalidPduData("truncated PDU header".into()))?
            as usize;

        if frag_length < PduHeader::SIZE {
            return Err(RpcError::InvalidPduData(format!(
                "invalid fragment length: {} < header size",
                frag_length
            )));
        }

        if frag_length > self.max_pdu_size {
            return Err(RpcError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            });
        }

        while self.read_buf.len() < frag_length {
            if self.fill_buf().await? == 0 {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete PDU: expected {} bytes, got {}",
                        frag_length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        let pdu_data = self.read_buf.split_to(frag_length);
        trace!(bytes = frag_length, "read PDU");
        Ok(pdu_data.freeze())
    }

    /// Read and decode a complete PDU
    pub async fn read_pdu_decoded(&mut self) -> Result<Pdu> {
        let data = self.read_pdu().await?;
        Pdu::decode(&data)
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }

    fn eof_error(&self, what: &str) -> RpcError {
        if self.read_buf.is_empty() {
            RpcError::ConnectionClosed
        } else {
            RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                what.to_string(),
            ))
        }
    }
}

impl<T: AsyncWrite + Unpin> DceRpcTransport<T> {
    /// Write a complete DCE RPC PDU (already encoded)
    pub async fn write_pdu(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        trace!(bytes = data.len(), "wrote PDU");
        Ok(())
    }

    /// Encode and write a PDU
    pub async fn write_pdu_encoded(&mut self, pdu: &Pdu) -> Result<()> {
        let data = pdu.encode()?;
        self.write_pdu(&data).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
