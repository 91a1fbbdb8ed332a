//! Upload receive state machine
//!
//! ```text
//! AwaitMetadata --metadata--> AwaitChunksOrEnd --chunk--> AwaitChunksOrEnd
//!                                               --end----> save
//! ```
//!
//! Every other transition fails the call. Chunks are accumulated in a
//! [`SpoolBuffer`]; storage is not touched until the client half-closes.

use ferry::{AdmissionPermit, CallContext, SpoolBuffer, TransferOrchestrator, validate_name};
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::proto::{UploadFileRequest, UploadFileResponse, upload_file_request::Data};
use crate::status::{interrupt_status, transfer_status};

enum UploadState {
    AwaitMetadata,
    AwaitChunksOrEnd { name: String, spool: SpoolBuffer },
}

/// Drive one upload to completion.
///
/// `_permit` is held until the save has finished or the call has failed.
pub(crate) async fn handle<S>(
    orchestrator: TransferOrchestrator,
    mut stream: S,
    ctx: CallContext,
    spool_threshold: usize,
    _permit: AdmissionPermit,
) -> Result<UploadFileResponse, Status>
where
    S: Stream<Item = Result<UploadFileRequest, Status>> + Unpin,
{
    let mut state = UploadState::AwaitMetadata;

    let (name, spool) = loop {
        let message = tokio::select! {
            biased;
            interrupt = ctx.interrupted() => return Err(interrupt_status(interrupt)),
            message = stream.next() => message,
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(status)) => {
                tracing::warn!(error = %status.message(), "upload receive failed");
                return Err(Status::unknown(format!(
                    "failed to receive upload: {}",
                    status.message()
                )));
            }
            None => match state {
                UploadState::AwaitMetadata => {
                    return Err(Status::invalid_argument(
                        "stream closed before file metadata",
                    ));
                }
                UploadState::AwaitChunksOrEnd { name, spool } => break (name, spool),
            },
        };

        state = match (state, message.data) {
            (UploadState::AwaitMetadata, Some(Data::Metadata(metadata))) => {
                validate_name(&metadata.name)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                tracing::debug!(name = %metadata.name, "upload metadata received");
                UploadState::AwaitChunksOrEnd {
                    name: metadata.name,
                    spool: SpoolBuffer::new(spool_threshold),
                }
            }
            (UploadState::AwaitMetadata, _) => {
                return Err(Status::invalid_argument(
                    "first upload message must carry file metadata",
                ));
            }
            (UploadState::AwaitChunksOrEnd { name, mut spool }, Some(Data::Chunk(chunk))) => {
                if let Err(e) = spool.append(&chunk).await {
                    tracing::error!(name = %name, error = %e, "failed to buffer upload");
                    return Err(Status::internal("failed to buffer upload"));
                }
                UploadState::AwaitChunksOrEnd { name, spool }
            }
            (UploadState::AwaitChunksOrEnd { .. }, Some(Data::Metadata(_))) => {
                return Err(Status::invalid_argument(
                    "file metadata may only be sent once",
                ));
            }
            (state @ UploadState::AwaitChunksOrEnd { .. }, None) => state,
        };
    };

    let size = spool.len();
    let source = spool.into_source().await.map_err(|e| {
        tracing::error!(name = %name, error = %e, "failed to rewind upload buffer");
        Status::internal("failed to buffer upload")
    })?;

    tracing::debug!(name = %name, size, "upload stream complete, saving");
    let record = orchestrator
        .upload(&name, source)
        .await
        .map_err(|e| transfer_status(&e))?;

    Ok(UploadFileResponse {
        name: record.name,
        size: record.size,
        created_at: Some(record.created_at.into()),
    })
}
