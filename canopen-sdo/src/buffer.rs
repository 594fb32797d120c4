// buffer.rs
use thiserror::Error;

/// Capacity allocated when a buffer is created
pub const SDO_BUFFER_INITIAL_SIZE: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer of {requested} bytes exceeds the limit of {limit} bytes")]
    LimitExceeded { requested: usize, limit: usize },
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),
}

/// Transfer payload storage.
///
/// Every growing operation is fallible so that an oversized transfer
/// becomes an out-of-memory abort instead of a crash.
#[derive(Debug, Clone)]
pub struct SdoBuffer {
    data: Vec<u8>,
    limit: Option<usize>,
}

impl SdoBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(SDO_BUFFER_INITIAL_SIZE),
            limit: None,
        }
    }

    /// Buffer that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Make sure the buffer can hold `total` bytes without reallocating
    pub fn reserve(&mut self, total: usize) -> Result<(), BufferError> {
        self.check_limit(total)?;
        let additional = total.saturating_sub(self.data.len());
        self.data
            .try_reserve(additional)
            .map_err(|_| BufferError::AllocationFailed(total))
    }

    /// Replace the contents with `bytes`; on failure the old contents stay
    pub fn assign(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.reserve(bytes.len())?;
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let total = self.data.len() + bytes.len();
        self.reserve(total)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn check_limit(&self, requested: usize) -> Result<(), BufferError> {
        match self.limit {
            Some(limit) if requested > limit => Err(BufferError::LimitExceeded { requested, limit }),
            _ => Ok(()),
        }
    }
}

impl Default for SdoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for SdoBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
