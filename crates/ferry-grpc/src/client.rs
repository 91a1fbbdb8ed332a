//! Transfer client
//!
//! A thin wrapper over the generated client that speaks the chunked stream
//! shapes: uploads are framed from any [`AsyncRead`], downloads are written
//! into any [`AsyncWrite`] after checking the metadata frame.

use std::io;
use std::time::SystemTime;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use crate::config::MAX_CHUNK_SIZE;
use crate::proto::{
    DownloadFileRequest, FileInfo, FileMetadata, ListFilesRequest, UploadFileRequest,
    UploadFileResponse, download_file_response::Content, file_service_client::FileServiceClient,
    upload_file_request::Data,
};

/// Default upload chunk size (1 MiB)
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

const UPLOAD_CHANNEL_CAPACITY: usize = 4;

/// Errors returned by [`TransferClient`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not connect to the server
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// The server failed the call
    #[error("server returned {}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),
    /// Reading the upload source or writing the download sink failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The server broke the stream contract
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A file as described by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Stored name
    pub name: String,
    /// Content length in bytes
    pub size: u64,
    /// When the current version was saved
    pub created_at: Option<SystemTime>,
    /// When the current version was last written
    pub updated_at: Option<SystemTime>,
}

fn system_time(ts: Option<prost_types::Timestamp>) -> Option<SystemTime> {
    ts.and_then(|ts| SystemTime::try_from(ts).ok())
}

impl From<FileMetadata> for RemoteFile {
    fn from(m: FileMetadata) -> Self {
        let created_at = system_time(m.created_at);
        Self {
            name: m.name,
            size: m.size,
            created_at,
            updated_at: created_at,
        }
    }
}

impl From<UploadFileResponse> for RemoteFile {
    fn from(r: UploadFileResponse) -> Self {
        let created_at = system_time(r.created_at);
        Self {
            name: r.name,
            size: r.size,
            created_at,
            updated_at: created_at,
        }
    }
}

impl From<FileInfo> for RemoteFile {
    fn from(f: FileInfo) -> Self {
        Self {
            name: f.name,
            size: f.size,
            created_at: system_time(f.created_at),
            updated_at: system_time(f.updated_at),
        }
    }
}

/// Client for the ferry file service
#[derive(Debug, Clone)]
pub struct TransferClient {
    inner: FileServiceClient<Channel>,
    chunk_size: usize,
}

impl TransferClient {
    /// Connect to a server at `endpoint`, e.g. `http://[::1]:50051`.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        Ok(Self::new(channel))
    }

    /// Wrap an existing channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: FileServiceClient::new(channel),
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    /// Use `chunk_size` bytes per upload chunk, clamped to
    /// `1..=`[`MAX_CHUNK_SIZE`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Upload everything `reader` yields under `name`.
    ///
    /// If reading the source fails the call is abandoned before the request
    /// stream is closed, so the server never commits a truncated file.
    pub async fn upload<R>(&mut self, name: &str, reader: R) -> Result<RemoteFile, ClientError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        let (failed_tx, failed_rx) = oneshot::channel();
        tokio::spawn(pump_upload(
            name.to_string(),
            reader,
            self.chunk_size,
            tx,
            failed_tx,
        ));

        let mut call = Box::pin(self.inner.upload_file(ReceiverStream::new(rx)));
        let (error, sender) = tokio::select! {
            response = &mut call => return Ok(response?.into_inner().into()),
            Ok(failure) = failed_rx => failure,
        };
        // Abort the call while the request stream is still open.
        drop(call);
        drop(sender);
        Err(ClientError::Io(error))
    }

    /// Download `name` into `writer`. Returns the file's metadata.
    pub async fn download<W>(&mut self, name: &str, writer: &mut W) -> Result<RemoteFile, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self
            .inner
            .download_file(DownloadFileRequest {
                name: name.to_string(),
            })
            .await?
            .into_inner();

        let metadata = match stream.message().await? {
            Some(frame) => match frame.content {
                Some(Content::Metadata(metadata)) => metadata,
                _ => {
                    return Err(ClientError::Protocol(
                        "first download frame must carry metadata".into(),
                    ));
                }
            },
            None => {
                return Err(ClientError::Protocol(
                    "download stream ended before metadata".into(),
                ));
            }
        };

        let mut received = 0u64;
        while let Some(frame) = stream.message().await? {
            match frame.content {
                Some(Content::Chunk(chunk)) => {
                    writer.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                }
                Some(Content::Metadata(_)) => {
                    return Err(ClientError::Protocol("metadata sent twice".into()));
                }
                None => {}
            }
        }
        writer.flush().await?;

        if received != metadata.size {
            return Err(ClientError::Protocol(format!(
                "expected {} bytes, received {received}",
                metadata.size
            )));
        }
        Ok(metadata.into())
    }

    /// Every stored file, newest first.
    pub async fn list(&mut self) -> Result<Vec<RemoteFile>, ClientError> {
        let response = self.inner.list_files(ListFilesRequest {}).await?;
        Ok(response
            .into_inner()
            .files
            .into_iter()
            .map(RemoteFile::from)
            .collect())
    }
}

type UploadFailure = (io::Error, mpsc::Sender<UploadFileRequest>);

async fn pump_upload<R>(
    name: String,
    mut reader: R,
    chunk_size: usize,
    tx: mpsc::Sender<UploadFileRequest>,
    failed: oneshot::Sender<UploadFailure>,
) where
    R: AsyncRead + Unpin,
{
    let metadata = UploadFileRequest {
        data: Some(Data::Metadata(FileMetadata {
            name,
            ..Default::default()
        })),
    };
    if tx.send(metadata).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                let chunk = UploadFileRequest {
                    data: Some(Data::Chunk(buf[..n].to_vec())),
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // Hand the sender over so the stream stays open until the
                // call has been dropped.
                let _ = failed.send((e, tx));
                return;
            }
        }
    }
}
