//! Admission control
//!
//! Two independent counting gates bound concurrent work: one for transfers
//! (uploads and downloads) and one for listings. A gate never queues: when it
//! has no permit left the call is rejected immediately with
//! [`AdmissionError::Exhausted`], so admitted work keeps predictable latency.
//!
//! Permits are RAII guards. Dropping an [`AdmissionPermit`] returns it to its
//! gate on every exit path, including panics and cancelled futures.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::context::{CallContext, Interrupt};

/// Class of work an operation belongs to, for admission purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Uploads and downloads share one gate
    Transfer,
    /// Listings have their own gate
    Listing,
    /// Not gated at all
    Unrestricted,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Transfer => f.write_str("upload/download"),
            OperationClass::Listing => f.write_str("list"),
            OperationClass::Unrestricted => f.write_str("unrestricted"),
        }
    }
}

/// The operations the file service exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Client-streamed upload
    UploadFile,
    /// Server-streamed download
    DownloadFile,
    /// Unary listing
    ListFiles,
}

impl Operation {
    /// The admission class of this operation.
    pub const fn class(self) -> OperationClass {
        match self {
            Operation::UploadFile | Operation::DownloadFile => OperationClass::Transfer,
            Operation::ListFiles => OperationClass::Listing,
        }
    }

    /// RPC method name, for logs.
    pub const fn method(self) -> &'static str {
        match self {
            Operation::UploadFile => "UploadFile",
            Operation::DownloadFile => "DownloadFile",
            Operation::ListFiles => "ListFiles",
        }
    }
}

/// Concurrency ceilings per gated class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionLimits {
    /// Maximum concurrent uploads plus downloads
    pub transfer: usize,
    /// Maximum concurrent listings
    pub listing: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            transfer: 10,
            listing: 100,
        }
    }
}

/// Reasons a call was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The class's gate had no free permit
    #[error("too many concurrent {0} requests")]
    Exhausted(OperationClass),
    /// The call was already cancelled or past its deadline
    #[error("{0}")]
    Interrupted(Interrupt),
}

/// A bounded counting gate with non-blocking acquisition
#[derive(Debug, Clone)]
pub struct Gate {
    class: OperationClass,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl Gate {
    /// Create a gate allowing `limit` concurrent holders.
    pub fn new(class: OperationClass, limit: usize) -> Self {
        Self {
            class,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit {
                class: self.class,
                _permit: Some(permit),
            }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                Err(AdmissionError::Exhausted(self.class))
            }
        }
    }

    /// The configured ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Proof of admission. The permit returns to its gate when dropped.
#[derive(Debug)]
#[must_use = "dropping the permit releases it immediately"]
pub struct AdmissionPermit {
    class: OperationClass,
    _permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    /// A permit for ungated work. Holds nothing.
    pub fn unrestricted() -> Self {
        Self {
            class: OperationClass::Unrestricted,
            _permit: None,
        }
    }

    /// The class this permit was issued for.
    pub fn class(&self) -> OperationClass {
        self.class
    }
}

/// Load-shedding admission controller owned by a server instance
#[derive(Debug, Clone)]
pub struct AdmissionController {
    transfer: Gate,
    listing: Gate,
}

impl AdmissionController {
    /// Create a controller with the given ceilings.
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            transfer: Gate::new(OperationClass::Transfer, limits.transfer),
            listing: Gate::new(OperationClass::Listing, limits.listing),
        }
    }

    /// The gate guarding `class`, or `None` for ungated classes.
    pub fn gate(&self, class: OperationClass) -> Option<&Gate> {
        match class {
            OperationClass::Transfer => Some(&self.transfer),
            OperationClass::Listing => Some(&self.listing),
            OperationClass::Unrestricted => None,
        }
    }

    /// Admit a call of `class` or reject it immediately.
    ///
    /// A call whose context is already interrupted is rejected with the
    /// interruption rather than with [`AdmissionError::Exhausted`], so callers
    /// can tell "you were cancelled" apart from "the server is saturated".
    pub fn admit(
        &self,
        class: OperationClass,
        ctx: &CallContext,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let Some(gate) = self.gate(class) else {
            return Ok(AdmissionPermit::unrestricted());
        };
        ctx.check().map_err(AdmissionError::Interrupted)?;
        let permit = gate.try_acquire();
        if permit.is_err() {
            tracing::warn!(
                class = %class,
                limit = gate.limit(),
                "admission rejected, gate saturated"
            );
        }
        permit
    }

    /// Free permits for `class`. Ungated classes report `usize::MAX`.
    pub fn available(&self, class: OperationClass) -> usize {
        self.gate(class).map_or(usize::MAX, Gate::available)
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionLimits::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    fn controller(transfer: usize, listing: usize) -> AdmissionController {
        AdmissionController::new(AdmissionLimits { transfer, listing })
    }

    #[test]
    fn test_operations_classified() {
        assert_eq!(Operation::UploadFile.class(), OperationClass::Transfer);
        assert_eq!(Operation::DownloadFile.class(), OperationClass::Transfer);
        assert_eq!(Operation::ListFiles.class(), OperationClass::Listing);
    }

    #[test]
    fn test_default_limits() {
        let limits = AdmissionLimits::default();
        assert_eq!(limits.transfer, 10);
        assert_eq!(limits.listing, 100);
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: AdmissionLimits = serde_json::from_str(r#"{"transfer": 3}"#).unwrap();
        assert_eq!(limits.transfer, 3);
        assert_eq!(limits.listing, 100);
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let admission = controller(2, 1);
        let ctx = CallContext::background();

        let first = admission.admit(OperationClass::Transfer, &ctx).unwrap();
        let second = admission.admit(OperationClass::Transfer, &ctx).unwrap();
        let third = admission.admit(OperationClass::Transfer, &ctx);

        assert_eq!(
            third.unwrap_err(),
            AdmissionError::Exhausted(OperationClass::Transfer)
        );
        assert_eq!(first.class(), OperationClass::Transfer);
        drop(second);
        assert_eq!(admission.available(OperationClass::Transfer), 1);
    }

    #[test]
    fn test_release_admits_blocked_caller() {
        let admission = controller(1, 1);
        let ctx = CallContext::background();

        let held = admission.admit(OperationClass::Transfer, &ctx).unwrap();
        assert!(admission.admit(OperationClass::Transfer, &ctx).is_err());

        drop(held);
        assert!(admission.admit(OperationClass::Transfer, &ctx).is_ok());
    }

    #[test]
    fn test_gates_are_independent() {
        let admission = controller(1, 1);
        let ctx = CallContext::background();

        let _transfer = admission.admit(OperationClass::Transfer, &ctx).unwrap();
        let _listing = admission.admit(OperationClass::Listing, &ctx).unwrap();

        assert_eq!(
            admission
                .admit(OperationClass::Listing, &ctx)
                .unwrap_err(),
            AdmissionError::Exhausted(OperationClass::Listing)
        );
    }

    #[test]
    fn test_unrestricted_bypasses_gates() {
        let admission = controller(0, 0);
        let ctx = CallContext::background();

        for _ in 0..10 {
            let permit = admission
                .admit(OperationClass::Unrestricted, &ctx)
                .unwrap();
            assert_eq!(permit.class(), OperationClass::Unrestricted);
        }
        assert_eq!(admission.available(OperationClass::Unrestricted), usize::MAX);
    }

    #[test]
    fn test_cancelled_context_reports_cancellation_not_exhaustion() {
        let admission = controller(0, 0);
        let token = CancellationToken::new();
        token.cancel();
        let ctx = CallContext::with_token(token);

        assert_eq!(
            admission.admit(OperationClass::Transfer, &ctx).unwrap_err(),
            AdmissionError::Interrupted(Interrupt::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_reported() {
        let admission = controller(1, 1);
        let ctx = CallContext::background().with_timeout(Duration::from_millis(1));
        tokio::time::advance(Duration::from_millis(5)).await;

        assert_eq!(
            admission.admit(OperationClass::Listing, &ctx).unwrap_err(),
            AdmissionError::Interrupted(Interrupt::DeadlineExceeded)
        );
        assert_eq!(admission.available(OperationClass::Listing), 1);
    }

    #[tokio::test]
    async fn test_permit_released_when_task_panics() {
        let admission = controller(1, 1);
        let permit = admission
            .admit(OperationClass::Transfer, &CallContext::background())
            .unwrap();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            panic!("handler defect");
        });
        assert!(handle.await.is_err());

        assert_eq!(admission.available(OperationClass::Transfer), 1);
    }

    #[test]
    fn test_exhausted_message_names_class() {
        let err = AdmissionError::Exhausted(OperationClass::Transfer);
        assert_eq!(err.to_string(), "too many concurrent upload/download requests");
    }
}
