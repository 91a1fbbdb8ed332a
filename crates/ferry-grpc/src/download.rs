//! Download send state machine
//!
//! The file is resolved before the response stream exists, so a missing file
//! fails the call without sending anything. Once streaming starts the first
//! frame is always the metadata frame, followed by content chunks of at most
//! the configured size, followed by end of stream.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::{Duration, Instant};

use ferry::{
    AdmissionPermit, ByteReader, CallContext, FileRecord, Operation, TransferOrchestrator,
};
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Code, Status};

use crate::proto::{DownloadFileResponse, FileMetadata, download_file_response::Content};
use crate::status::{fault_status, interrupt_status, transfer_status};

/// Frames buffered between the reader task and the transport
const CHANNEL_CAPACITY: usize = 4;

/// How long a terminal error may wait for room in the channel
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type DownloadStream =
    Pin<Box<dyn Stream<Item = Result<DownloadFileResponse, Status>> + Send>>;

/// Resolve `name` and start streaming it.
///
/// The permit moves into the streaming task and is released when the last
/// frame has been handed to the transport or the client goes away.
pub(crate) async fn handle(
    orchestrator: TransferOrchestrator,
    name: String,
    ctx: CallContext,
    chunk_size: usize,
    permit: AdmissionPermit,
) -> Result<DownloadStream, Status> {
    let (record, reader) = orchestrator
        .download(&name)
        .await
        .map_err(|e| transfer_status(&e))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(stream_file(record, reader, chunk_size, ctx, tx, permit));

    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// How a download ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Every frame was handed to the transport
    Complete,
    /// The receiving side was dropped part-way through
    ClientGone,
}

/// Run the send loop to its end and log the final code.
///
/// A client that goes away is reported as `Cancelled`.
async fn stream_file(
    record: FileRecord,
    reader: ByteReader,
    chunk_size: usize,
    ctx: CallContext,
    tx: mpsc::Sender<Result<DownloadFileResponse, Status>>,
    _permit: AdmissionPermit,
) -> Code {
    let started = Instant::now();
    let name = record.name.clone();
    let size = record.size;
    let outcome = AssertUnwindSafe(send_file(record, reader, chunk_size, &ctx, &tx))
        .catch_unwind()
        .await;

    let code = match outcome {
        Ok(Ok(Delivery::Complete)) => Code::Ok,
        Ok(Ok(Delivery::ClientGone)) => {
            tracing::info!(name = %name, "download client disconnected");
            Code::Cancelled
        }
        Ok(Err(status)) => abort(&name, status, &tx).await,
        Err(panic) => abort(&name, fault_status(Operation::DownloadFile, panic), &tx).await,
    };

    tracing::info!(
        method = Operation::DownloadFile.method(),
        name = %name,
        size,
        code = ?code,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "download stream completed"
    );
    code
}

/// Hand a terminal error to the transport if there is room for it.
async fn abort(
    name: &str,
    status: Status,
    tx: &mpsc::Sender<Result<DownloadFileResponse, Status>>,
) -> Code {
    let code = status.code();
    tracing::warn!(name = %name, code = ?code, "download stream aborted");
    let _ = tokio::time::timeout(TERMINAL_SEND_TIMEOUT, tx.send(Err(status))).await;
    code
}

async fn send_file(
    record: FileRecord,
    mut reader: ByteReader,
    chunk_size: usize,
    ctx: &CallContext,
    tx: &mpsc::Sender<Result<DownloadFileResponse, Status>>,
) -> Result<Delivery, Status> {
    let metadata = FileMetadata {
        name: record.name.clone(),
        size: record.size,
        created_at: Some(record.created_at.into()),
    };
    if !send(tx, ctx, Content::Metadata(metadata)).await? {
        return Ok(Delivery::ClientGone);
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = fill(&mut reader, &mut buf).await.map_err(|e| {
            tracing::error!(name = %record.name, error = %e, "failed to read file content");
            Status::internal("failed to read file content")
        })?;
        if n == 0 {
            return Ok(Delivery::Complete);
        }
        if !send(tx, ctx, Content::Chunk(buf[..n].to_vec())).await? {
            return Ok(Delivery::ClientGone);
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
async fn fill(reader: &mut ByteReader, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Send one frame. `Ok(false)` means the client has gone away.
async fn send(
    tx: &mpsc::Sender<Result<DownloadFileResponse, Status>>,
    ctx: &CallContext,
    content: Content,
) -> Result<bool, Status> {
    let frame = DownloadFileResponse {
        content: Some(content),
    };
    tokio::select! {
        biased;
        interrupt = ctx.interrupted() => Err(interrupt_status(interrupt)),
        sent = tx.send(Ok(frame)) => Ok(sent.is_ok()),
    }
}
