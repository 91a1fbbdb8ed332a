//! Ferry: streamed file storage with admission control
//!
//! This crate holds everything below the RPC boundary of the ferry file
//! service:
//!
//! - [`FsStorage`] persists named blobs in a flat directory. Every save is
//!   staged in a private file and promoted with a single atomic rename, so a
//!   record is either fully visible or not visible at all.
//! - [`TransferOrchestrator`] validates names, stamps timestamps and hands
//!   bytes to the storage engine.
//! - [`AdmissionController`] bounds how many transfers and listings may run
//!   at once, rejecting excess work instead of queueing it.
//! - [`CallContext`] carries the cancellation and deadline of one call so that
//!   every suspension point can unwind promptly.
//!
//! The gRPC protocol layer lives in the `ferry-grpc` crate.

mod admission;
mod context;
mod orchestrator;
mod record;
mod spool;
mod storage;
mod validation;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionLimits, AdmissionPermit, Gate, Operation,
    OperationClass,
};
pub use context::{CallContext, Interrupt};
pub use orchestrator::{TransferError, TransferOrchestrator};
pub use record::FileRecord;
pub use spool::{DEFAULT_SPOOL_THRESHOLD, SpoolBuffer};
pub use storage::{ByteReader, DataSource, FileStorage, FsStorage, StorageError};
pub use validation::{MAX_NAME_LEN, ValidationError, validate_name};
