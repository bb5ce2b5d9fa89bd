//! Byte-counting stream decorators.
//!
//! The Block codec needs to know exactly how many compressed bytes passed
//! through the filter chain. These wrappers are composed at chain
//! construction time; the running total stays reachable through a shared
//! [`ByteCounter`] handle even while the chain owns the wrapper.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::filter::FinishWrite;

/// Shared view of a counting decorator's running total.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Rc<Cell<u64>>);

impl ByteCounter {
    /// Bytes that have passed through the decorator so far.
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    fn add(&self, n: u64) {
        self.0.set(self.0.get() + n);
    }
}

pub struct CountingReader<R> {
    inner: R,
    count: ByteCounter,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: ByteCounter::default(),
        }
    }

    pub fn counter(&self) -> ByteCounter {
        self.count.clone()
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.add(n as u64);
        Ok(n)
    }
}

pub struct CountingWriter<W> {
    inner: W,
    count: ByteCounter,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            count: ByteCounter::default(),
        }
    }

    pub fn counter(&self) -> ByteCounter {
        self.count.clone()
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> FinishWrite for CountingWriter<W> {
    fn finish(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
