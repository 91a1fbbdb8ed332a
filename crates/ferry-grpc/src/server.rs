//! gRPC server implementation for the file service.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status, Streaming};

use ferry::{
    AdmissionController, AdmissionPermit, CallContext, FileRecord, FsStorage, Operation,
    TransferOrchestrator,
};

use crate::config::{MAX_CHUNK_SIZE, ServerConfig, TransferOptions};
use crate::download::{self, DownloadStream};
use crate::proto::{
    self, DownloadFileRequest, FileInfo, ListFilesRequest, ListFilesResponse, UploadFileRequest,
    UploadFileResponse, file_service_server::FileServiceServer,
};
use crate::status::{admission_status, fault_status, transfer_status};
use crate::upload;

/// How long in-flight calls get to unwind after being force-cancelled
const FORCE_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// The file service implementation.
///
/// Cloning is cheap; clones share the storage engine and the admission gates.
#[derive(Clone, Debug)]
pub struct FileTransferService {
    orchestrator: TransferOrchestrator,
    admission: Arc<AdmissionController>,
    options: TransferOptions,
    shutdown: CancellationToken,
}

impl FileTransferService {
    /// Create a service with default transfer options.
    pub fn new(orchestrator: TransferOrchestrator, admission: Arc<AdmissionController>) -> Self {
        Self {
            orchestrator,
            admission,
            options: TransferOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the streaming knobs. The download chunk size is clamped to
    /// `1..=`[`MAX_CHUNK_SIZE`].
    pub fn with_options(mut self, mut options: TransferOptions) -> Self {
        options.download_chunk_size = options.download_chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self.options = options;
        self
    }

    /// Cancel every in-flight call when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The admission controller guarding this service.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    fn call_context(&self, metadata: &MetadataMap) -> CallContext {
        let ctx = CallContext::with_token(self.shutdown.child_token());
        match metadata
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
        {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Run `handler` under admission control, per-call logging and the fault
    /// boundary. A panic inside the handler becomes `Internal` and its permit
    /// is released.
    ///
    /// For `DownloadFile` the logged code covers stream setup only; the
    /// streaming task logs "download stream completed" with the final code.
    async fn dispatch<T, F, Fut>(
        &self,
        op: Operation,
        ctx: &CallContext,
        handler: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(AdmissionPermit) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let started = Instant::now();
        tracing::debug!(method = op.method(), class = %op.class(), "call started");

        let result = match self.admission.admit(op.class(), ctx) {
            Ok(permit) => match AssertUnwindSafe(handler(permit)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(fault_status(op, panic)),
            },
            Err(err) => Err(admission_status(err)),
        };

        let code = result.as_ref().map_or_else(Status::code, |_| Code::Ok);
        tracing::info!(
            method = op.method(),
            class = %op.class(),
            code = ?code,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "call completed"
        );
        result
    }
}

#[tonic::async_trait]
impl proto::file_service_server::FileService for FileTransferService {
    async fn upload_file(
        &self,
        request: Request<Streaming<UploadFileRequest>>,
    ) -> Result<Response<UploadFileResponse>, Status> {
        let ctx = self.call_context(request.metadata());
        let stream = request.into_inner();
        let orchestrator = self.orchestrator.clone();
        let spool_threshold = self.options.spool_threshold;
        let handler_ctx = ctx.clone();

        self.dispatch(Operation::UploadFile, &ctx, move |permit| {
            upload::handle(orchestrator, stream, handler_ctx, spool_threshold, permit)
        })
        .await
        .map(Response::new)
    }

    type DownloadFileStream = DownloadStream;

    async fn download_file(
        &self,
        request: Request<DownloadFileRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        let ctx = self.call_context(request.metadata());
        let name = request.into_inner().name;
        let orchestrator = self.orchestrator.clone();
        let chunk_size = self.options.download_chunk_size;
        let handler_ctx = ctx.clone();

        self.dispatch(Operation::DownloadFile, &ctx, move |permit| {
            download::handle(orchestrator, name, handler_ctx, chunk_size, permit)
        })
        .await
        .map(Response::new)
    }

    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        let ctx = self.call_context(request.metadata());
        let orchestrator = self.orchestrator.clone();

        self.dispatch(Operation::ListFiles, &ctx, move |permit| {
            list(orchestrator, permit)
        })
        .await
        .map(Response::new)
    }
}

async fn list(
    orchestrator: TransferOrchestrator,
    _permit: AdmissionPermit,
) -> Result<ListFilesResponse, Status> {
    let records = orchestrator.list().await.map_err(|e| transfer_status(&e))?;
    Ok(ListFilesResponse {
        files: records.into_iter().map(file_info).collect(),
    })
}

fn file_info(record: FileRecord) -> FileInfo {
    FileInfo {
        name: record.name,
        created_at: Some(record.created_at.into()),
        updated_at: Some(record.updated_at.into()),
        size: record.size,
    }
}

/// Parse a `grpc-timeout` header value such as `250m` or `30S`.
///
/// The value is at most eight ASCII digits followed by one unit:
/// `H` hours, `M` minutes, `S` seconds, `m` milliseconds, `u` microseconds or
/// `n` nanoseconds.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Runs the file service until a shutdown signal, then drains it.
#[derive(Debug)]
pub struct FerryServer {
    config: ServerConfig,
}

impl FerryServer {
    /// Create a server from a configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.config.addr))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves.
    ///
    /// After the signal no new calls are accepted. In-flight calls get the
    /// configured grace period to finish; any still running after that are
    /// cancelled and end with `Cancelled`.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let storage = FsStorage::open(&self.config.storage_root)
            .await
            .context("cannot open storage")?;
        let root = storage.root().to_path_buf();

        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        let service = FileTransferService::new(
            TransferOrchestrator::new(Arc::new(storage)),
            Arc::new(AdmissionController::new(self.config.limits)),
        )
        .with_options(self.config.transfer)
        .with_shutdown(force.clone());

        let addr = listener.local_addr()?;
        tracing::info!(
            addr = %addr,
            root = %root.display(),
            transfer_limit = self.config.limits.transfer,
            listing_limit = self.config.limits.listing,
            "Starting gRPC server"
        );

        let server = tonic::transport::Server::builder()
            .add_service(FileServiceServer::new(service))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                drain.clone().cancelled_owned(),
            );
        tokio::pin!(server);
        tokio::pin!(signal);

        tokio::select! {
            result = &mut server => {
                result?;
                tracing::info!("gRPC server shut down");
                return Ok(());
            }
            () = &mut signal => {}
        }

        tracing::info!(
            grace_ms = u64::try_from(self.config.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
            "draining in-flight calls"
        );
        drain.cancel();
        match tokio::time::timeout(self.config.shutdown_grace, &mut server).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("shutdown grace period elapsed, cancelling in-flight calls");
                force.cancel();
                match tokio::time::timeout(FORCE_CANCEL_GRACE, &mut server).await {
                    Ok(result) => result?,
                    Err(_) => tracing::warn!("in-flight calls did not stop, exiting anyway"),
                }
            }
        }

        tracing::info!("gRPC server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ferry::AdmissionLimits;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_grpc_timeout_units() {
        let cases = [
            ("2H", Duration::from_secs(7200)),
            ("3M", Duration::from_secs(180)),
            ("30S", Duration::from_secs(30)),
            ("250m", Duration::from_millis(250)),
            ("99999999u", Duration::from_micros(99_999_999)),
            ("5n", Duration::from_nanos(5)),
        ];
        for (value, expected) in cases {
            assert_eq!(parse_grpc_timeout(value), Some(expected), "{value}");
        }
    }

    #[test]
    fn test_parse_grpc_timeout_rejects_garbage() {
        for value in ["", "m", "10", "10x", "-1S", "123456789S", "1.5S", "10é"] {
            assert_eq!(parse_grpc_timeout(value), None, "{value:?}");
        }
    }

    async fn service(tmp: &TempDir, limits: AdmissionLimits) -> FileTransferService {
        let storage = FsStorage::open(tmp.path()).await.unwrap();
        FileTransferService::new(
            TransferOrchestrator::new(Arc::new(storage)),
            Arc::new(AdmissionController::new(limits)),
        )
    }

    #[tokio::test]
    async fn test_download_chunk_size_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp, AdmissionLimits::default())
            .await
            .with_options(TransferOptions {
                download_chunk_size: 8 * 1024 * 1024,
                ..TransferOptions::default()
            });
        assert_eq!(service.options.download_chunk_size, MAX_CHUNK_SIZE);

        let service = service.with_options(TransferOptions {
            download_chunk_size: 0,
            ..TransferOptions::default()
        });
        assert_eq!(service.options.download_chunk_size, 1);
    }

    #[tokio::test]
    async fn test_call_context_honours_timeout_header() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp, AdmissionLimits::default()).await;

        let mut metadata = MetadataMap::new();
        assert!(service.call_context(&metadata).deadline().is_none());

        metadata.insert("grpc-timeout", "5S".parse().unwrap());
        assert!(service.call_context(&metadata).deadline().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_token_cancels_call_context() {
        let tmp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let service = service(&tmp, AdmissionLimits::default())
            .await
            .with_shutdown(token.clone());

        let ctx = service.call_context(&MetadataMap::new());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(ctx.check().is_err());
    }

    async fn panicking(_permit: AdmissionPermit) -> Result<(), Status> {
        panic!("handler bug");
    }

    #[tokio::test]
    async fn test_dispatch_recovers_panics_and_releases_permit() {
        let tmp = TempDir::new().unwrap();
        let limits = AdmissionLimits {
            transfer: 1,
            listing: 1,
        };
        let service = service(&tmp, limits).await;
        let ctx = CallContext::background();

        let result = service
            .dispatch(Operation::ListFiles, &ctx, panicking)
            .await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);

        assert_eq!(
            service.admission().available(ferry::OperationClass::Listing),
            1
        );
        let result = service
            .dispatch(Operation::ListFiles, &ctx, |permit| list(service.orchestrator.clone(), permit))
            .await;
        assert!(result.unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_interrupted_context() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp, AdmissionLimits::default()).await;
        let ctx = CallContext::background();
        ctx.cancel();

        let result = service
            .dispatch(Operation::UploadFile, &ctx, |_permit| async {
                Ok::<(), Status>(())
            })
            .await;
        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            storage_root: tmp.path().join("store"),
            shutdown_grace: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(FerryServer::new(config).serve(listener, async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tmp.path().join("store").is_dir());
    }
}
