//! Remote metadata store client
//!
//! A thin request/reply client: one operation per request, JSON-encoded in a
//! length-prefixed frame over a single lazily-dialed TCP connection.
//! Requests are serialized; the store is the arbiter of revisions and
//! catalog membership.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{MetaEntry, MetadataError, MetadataSvc, Revision};
use async_trait::async_trait;

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Operation discriminant carried in each request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaOp {
    /// Read a key.
    Get,
    /// Create a key.
    Add,
    /// Write a key.
    Set,
    /// Delete a key.
    Del,
    /// Delete a key and drop it from its catalog.
    DelWithCatalog,
    /// Enumerate a catalog.
    GetAllFromCatalog,
    /// Delete a whole catalog.
    DelAllFromCatalog,
}

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRequest {
    /// Operation to perform.
    pub op: MetaOp,
    /// Target key, or the catalog key for catalog-wide operations.
    pub key: String,
    /// Value for `add`/`set`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    /// Revision precondition for `set`/`del`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Catalog key for `del_with_catalog`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_key: Option<String>,
}

/// Status discriminant of a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaStatus {
    /// Operation succeeded.
    Ok,
    /// Key absent.
    NotFound,
    /// `add` target already present.
    AlreadyExists,
    /// Revision precondition failed.
    RevMismatch,
    /// Any other store-side failure; details in `error`.
    Error,
}

/// One catalog entry on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaWireEntry {
    /// Full key of the entry.
    pub key: String,
    /// Stored value.
    pub value: Vec<u8>,
    /// Revision of the entry.
    pub rev: Option<Revision>,
}

/// One reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaReply {
    /// Outcome of the operation.
    pub status: MetaStatus,
    /// Value for `get`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    /// Revision for `get`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Entries for catalog enumeration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<MetaWireEntry>>,
    /// Error detail when `status` is [`MetaStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<T: Serialize>(
    stream: &mut TcpStream,
    body: &T,
) -> Result<(), MetadataError> {
    let payload = serde_json::to_vec(body)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(MetadataError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut TcpStream,
) -> Result<T, MetadataError> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(MetadataError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Request/reply client to a remote metadata store.
pub struct RemoteMetadataSvc {
    addr: String,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
}

impl RemoteMetadataSvc {
    /// Create a client for the store at `addr`. The connection is dialed on
    /// first use.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Address this client dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send_request(&self, request: MetaRequest) -> Result<MetaReply, MetadataError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            debug!(addr = %self.addr, "dialing metadata store");
            *guard = Some(TcpStream::connect(&self.addr).await?);
        }
        let stream = guard.as_mut().expect("connection just established");

        let result = async {
            write_frame(stream, &request).await?;
            read_frame::<MetaReply>(stream).await
        }
        .await;

        if result.is_err() {
            // drop the connection so the next request redials
            warn!(addr = %self.addr, "metadata store request failed, resetting connection");
            *guard = None;
        }
        result
    }

    async fn expect_ok(&self, request: MetaRequest) -> Result<(), MetadataError> {
        let reply = self.send_request(request).await?;
        Self::status_to_result(reply).map(|_| ())
    }

    fn status_to_result(reply: MetaReply) -> Result<MetaReply, MetadataError> {
        match reply.status {
            MetaStatus::Ok => Ok(reply),
            MetaStatus::NotFound => Err(MetadataError::NotFound),
            MetaStatus::AlreadyExists => Err(MetadataError::AlreadyExists),
            MetaStatus::RevMismatch => Err(MetadataError::RevisionMismatch),
            MetaStatus::Error => Err(MetadataError::Remote(
                reply.error.unwrap_or_else(|| "unspecified".to_string()),
            )),
        }
    }
}

#[async_trait]
impl MetadataSvc for RemoteMetadataSvc {
    async fn get(&self, key: &str) -> Result<(Bytes, Revision), MetadataError> {
        let reply = self
            .send_request(MetaRequest {
                op: MetaOp::Get,
                key: key.to_string(),
                value: None,
                rev: None,
                catalog_key: None,
            })
            .await?;
        let reply = Self::status_to_result(reply)?;
        let value = reply
            .value
            .ok_or_else(|| MetadataError::Protocol("get reply without value".to_string()))?;
        let rev = reply
            .rev
            .ok_or_else(|| MetadataError::Protocol("get reply without revision".to_string()))?;
        Ok((Bytes::from(value), rev))
    }

    async fn add(&self, key: &str, value: Bytes) -> Result<(), MetadataError> {
        self.expect_ok(MetaRequest {
            op: MetaOp::Add,
            key: key.to_string(),
            value: Some(value.to_vec()),
            rev: None,
            catalog_key: None,
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        rev: Option<Revision>,
    ) -> Result<(), MetadataError> {
        self.expect_ok(MetaRequest {
            op: MetaOp::Set,
            key: key.to_string(),
            value: Some(value.to_vec()),
            rev,
            catalog_key: None,
        })
        .await
    }

    async fn del(&self, key: &str, rev: Option<Revision>) -> Result<(), MetadataError> {
        self.expect_ok(MetaRequest {
            op: MetaOp::Del,
            key: key.to_string(),
            value: None,
            rev,
            catalog_key: None,
        })
        .await
    }

    async fn del_with_catalog(
        &self,
        catalog_key: &str,
        key: &str,
        rev: Option<Revision>,
    ) -> Result<(), MetadataError> {
        self.expect_ok(MetaRequest {
            op: MetaOp::DelWithCatalog,
            key: key.to_string(),
            value: None,
            rev,
            catalog_key: Some(catalog_key.to_string()),
        })
        .await
    }

    async fn get_all_from_catalog(
        &self,
        catalog_key: &str,
    ) -> Result<Vec<MetaEntry>, MetadataError> {
        let reply = self
            .send_request(MetaRequest {
                op: MetaOp::GetAllFromCatalog,
                key: catalog_key.to_string(),
                value: None,
                rev: None,
                catalog_key: None,
            })
            .await?;
        let reply = Self::status_to_result(reply)?;
        Ok(reply
            .entries
            .unwrap_or_default()
            .into_iter()
            .map(|e| MetaEntry {
                key: e.key,
                value: Bytes::from(e.value),
                rev: e.rev,
            })
            .collect())
    }

    async fn del_all_from_catalog(&self, catalog_key: &str) -> Result<(), MetadataError> {
        self.expect_ok(MetaRequest {
            op: MetaOp::DelAllFromCatalog,
            key: catalog_key.to_string(),
            value: None,
            rev: None,
            catalog_key: None,
        })
        .await
    }
}
