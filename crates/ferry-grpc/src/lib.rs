//! Ferry gRPC Server
//!
//! Exposes the ferry file service over gRPC: client-streamed uploads,
//! server-streamed downloads and a unary listing, each guarded by the
//! admission controller from the `ferry` crate.
//!
//! # Stream shapes
//!
//! ```text
//! UploadFile                                DownloadFile
//! Client                Server              Client                Server
//! │  metadata{name}       │                 │  {name}               │
//! │ ─────────────────────>│                 │ ─────────────────────>│
//! │  chunk                │                 │       metadata{size}  │
//! │ ─────────────────────>│                 │<───────────────────── │
//! │  chunk ...            │                 │       chunk ...       │
//! │ ─────────────────────>│                 │<───────────────────── │
//! │  (end of stream)      │                 │       (end of stream) │
//! │ ─────────────────────>│                 │<───────────────────── │
//! │   {name,size,created} │                 │                       │
//! │<───────────────────── │                 │                       │
//! ```
//!
//! Nothing is persisted until the upload stream ends cleanly, and a download
//! never starts streaming before the file has been resolved.

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("ferry.v1");
}

mod client;
mod config;
mod download;
mod server;
mod status;
mod upload;

pub use client::{ClientError, DEFAULT_UPLOAD_CHUNK_SIZE, RemoteFile, TransferClient};
pub use config::{
    ConfigError, DEFAULT_DOWNLOAD_CHUNK_SIZE, MAX_CHUNK_SIZE, ServerConfig, TransferOptions,
};
pub use server::{FerryServer, FileTransferService, parse_grpc_timeout};

// Re-export proto types for convenience
pub use proto::{
    file_service_client::FileServiceClient, file_service_server::FileServiceServer,
};
