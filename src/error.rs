//! Kernel-wide outcome kinds.
//!
//! Synchronization primitives report their own, narrower `PendStat`
//! (see [`crate::event`]); everything else returns [`KernelError`].

/// Outcome of a non-blocking kernel API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    InvalidArg,
    NoMemory,
    NotPermitted,
    NotFound,
    IoError,
    Busy,
    Timeout,
    Aborted,
    Fatal,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Map to a small negative code suitable as a hypercall return value.
    pub fn as_hvc_code(self) -> i64 {
        -(match self {
            KernelError::InvalidArg => 1,
            KernelError::NoMemory => 2,
            KernelError::NotPermitted => 3,
            KernelError::NotFound => 4,
            KernelError::IoError => 5,
            KernelError::Busy => 6,
            KernelError::Timeout => 7,
            KernelError::Aborted => 8,
            KernelError::Fatal => 9,
        } as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hvc_codes_are_distinct_and_negative() {
        let kinds = [
            KernelError::InvalidArg,
            KernelError::NoMemory,
            KernelError::NotPermitted,
            KernelError::NotFound,
            KernelError::IoError,
            KernelError::Busy,
            KernelError::Timeout,
            KernelError::Aborted,
            KernelError::Fatal,
        ];
        for (i, a) in kinds.iter().enumerate() {
            assert!(a.as_hvc_code() < 0);
            for (j, b) in kinds.iter().enumerate() {
                if i != j {
                    assert_ne!(a.as_hvc_code(), b.as_hvc_code());
                }
            }
        }
    }
}
