//! Mapping from ferry errors to gRPC status codes.
//!
//! This is the only place error meaning is translated to the wire. Storage
//! failures are logged in full here and reported to the client opaquely.

use std::any::Any;

use ferry::{AdmissionError, Interrupt, Operation, TransferError};
use tonic::Status;

pub(crate) fn transfer_status(err: &TransferError) -> Status {
    match err {
        TransferError::Validation(e) => Status::invalid_argument(e.to_string()),
        TransferError::NotFound(_) => Status::not_found("file not found"),
        TransferError::Storage(e) => {
            tracing::error!(error = %e, "storage failure");
            Status::internal("storage failure")
        }
    }
}

pub(crate) fn admission_status(err: AdmissionError) -> Status {
    match err {
        AdmissionError::Exhausted(_) => Status::resource_exhausted(err.to_string()),
        AdmissionError::Interrupted(interrupt) => interrupt_status(interrupt),
    }
}

pub(crate) fn interrupt_status(interrupt: Interrupt) -> Status {
    match interrupt {
        Interrupt::Cancelled => Status::cancelled(interrupt.to_string()),
        Interrupt::DeadlineExceeded => Status::deadline_exceeded(interrupt.to_string()),
    }
}

/// Convert a panic caught at the handler boundary into `Internal`.
pub(crate) fn fault_status(op: Operation, panic: Box<dyn Any + Send>) -> Status {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    tracing::error!(method = op.method(), panic = %message, "recovered from panic in handler");
    Status::internal("internal server error")
}

#[cfg(test)]
mod tests {
    use std::io;

    use ferry::{OperationClass, StorageError, ValidationError};
    use tonic::Code;

    use super::*;

    #[test]
    fn test_transfer_errors_map_to_distinct_codes() {
        let cases = [
            (
                TransferError::Validation(ValidationError::Empty),
                Code::InvalidArgument,
            ),
            (TransferError::NotFound("x".into()), Code::NotFound),
            (
                TransferError::Storage(StorageError::Io {
                    context: "write staging file".into(),
                    source: io::Error::other("disk full"),
                }),
                Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(transfer_status(&err).code(), code, "{err}");
        }
    }

    #[test]
    fn test_storage_detail_not_leaked() {
        let err = TransferError::Storage(StorageError::Io {
            context: "open /srv/secret/path".into(),
            source: io::Error::other("boom"),
        });
        assert!(!transfer_status(&err).message().contains("/srv"));
    }

    #[test]
    fn test_admission_errors() {
        let status = admission_status(AdmissionError::Exhausted(OperationClass::Listing));
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert_eq!(status.message(), "too many concurrent list requests");

        assert_eq!(
            admission_status(AdmissionError::Interrupted(Interrupt::Cancelled)).code(),
            Code::Cancelled
        );
        assert_eq!(
            admission_status(AdmissionError::Interrupted(Interrupt::DeadlineExceeded)).code(),
            Code::DeadlineExceeded
        );
    }

    #[test]
    fn test_fault_status_is_internal() {
        let status = fault_status(Operation::ListFiles, Box::new("index out of bounds"));
        assert_eq!(status.code(), Code::Internal);
        let status = fault_status(Operation::UploadFile, Box::new(String::from("oops")));
        assert_eq!(status.code(), Code::Internal);
    }
}
