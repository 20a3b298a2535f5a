use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("operation cancelled during {step}")]
pub struct Cancelled {
    pub step: String,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, step: &str) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    pub fn io_error(&self, step: &str) -> io::Error {
        io::Error::other(Cancelled {
            step: step.to_string(),
        })
    }
}

/// Finds a cancellation anywhere in an error chain, including one carried
/// inside an `io::Error` by a cancellable reader.
pub fn cancellation_in(err: &anyhow::Error) -> Option<&Cancelled> {
    err.chain().find_map(|cause| {
        cause.downcast_ref::<Cancelled>().or_else(|| {
            cause
                .downcast_ref::<io::Error>()
                .and_then(|io_err| io_err.get_ref())
                .and_then(|inner| inner.downcast_ref::<Cancelled>())
        })
    })
}

/// Reader that fails with a cancellation error once the token trips.
pub struct CancellableReader<R> {
    inner: R,
    token: CancelToken,
    step: &'static str,
}

impl<R: Read> CancellableReader<R> {
    pub fn new(inner: R, token: CancelToken, step: &'static str) -> Self {
        Self { inner, token, step }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(self.token.io_error(self.step));
        }
        self.inner.read(buf)
    }
}
