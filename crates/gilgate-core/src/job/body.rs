//! Partially buffered request body.

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;

use crate::error::BodyError;

/// A request body whose first bytes are held in memory and whose remainder,
/// if any, is streamed on demand from the connection.
///
/// The body can be rewound for a resubmission only while nothing beyond the
/// initial buffer has been consumed.
pub struct RequestBody {
    initial: Bytes,
    position: usize,
    rest: Option<Box<dyn Read + Send>>,
    partial: bool,
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::buffered(Bytes::new())
    }

    /// A body that fits entirely in memory.
    pub fn buffered(initial: Bytes) -> Self {
        Self {
            initial,
            position: 0,
            rest: None,
            partial: false,
        }
    }

    /// A body with an in-memory prefix and a streamed remainder.
    pub fn streaming(initial: Bytes, rest: Box<dyn Read + Send>) -> Self {
        Self {
            initial,
            position: 0,
            rest: Some(rest),
            partial: false,
        }
    }

    /// Whether bytes beyond the initial buffer have been consumed
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn buffered_len(&self) -> usize {
        self.initial.len()
    }

    /// Reset the read position to the start of the body.
    ///
    /// # Errors
    ///
    /// Returns [`BodyError::NotRewindable`] once any streamed byte has been read.
    pub fn rewind(&mut self) -> Result<(), BodyError> {
        if self.partial {
            return Err(BodyError::NotRewindable);
        }
        self.position = 0;
        Ok(())
    }

    /// Read the remaining body to the end.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.initial.len().saturating_sub(self.position));
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position < self.initial.len() {
            let available = &self.initial[self.position..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.position += n;
            return Ok(n);
        }
        match self.rest.as_mut() {
            Some(rest) => {
                let n = rest.read(buf)?;
                if n > 0 {
                    self.partial = true;
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("buffered", &self.initial.len())
            .field("position", &self.position)
            .field("streaming", &self.rest.is_some())
            .field("partial", &self.partial)
            .finish()
    }
}
