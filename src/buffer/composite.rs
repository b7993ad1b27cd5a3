//! Composite buffers: N owned components behind one logical index range.
//!
//! Reads dispatch to the component covering an offset, found by binary
//! search over component start offsets. Adding a component transfers its
//! ownership unit to the composite; the composite's own reference count
//! covers all components, and releasing it to zero releases every child
//! exactly once.

use crate::buffer::{Allocator, ByteBuf};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Component {
    buf: ByteBuf,
    /// Logical offset of this component's first byte.
    start: usize,
    /// Reader index inside `buf` where the content begins.
    first: usize,
    len: usize,
}

/// A logical concatenation of owned component buffers.
pub struct CompositeBuf {
    components: Vec<Component>,
    reader: usize,
    writer: usize,
    refs: AtomicUsize,
    alloc: Allocator,
}

impl CompositeBuf {
    pub(crate) fn new(alloc: Allocator) -> CompositeBuf {
        CompositeBuf {
            components: Vec::new(),
            reader: 0,
            writer: 0,
            refs: AtomicUsize::new(1),
            alloc,
        }
    }

    fn check_accessible(&self) -> Result<()> {
        let count = self.refs.load(Ordering::Acquire);
        if count == 0 {
            return Err(Error::IllegalReferenceCount { count });
        }
        Ok(())
    }

    /// Current reference count of the composite.
    pub fn ref_cnt(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Add one unit of ownership over the composite and all components.
    pub fn retain(&self) -> Result<()> {
        let mut cur = self.refs.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(Error::IllegalReferenceCount { count: 0 });
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Drop one unit of ownership; at zero every component is released.
    pub fn release(&mut self) -> Result<bool> {
        let mut cur = self.refs.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(Error::IllegalReferenceCount { count: 0 });
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        if cur == 1 {
            for comp in self.components.drain(..) {
                // Children may be shared elsewhere via retained views; a
                // failed release would mean a double-free path, so surface it.
                comp.buf.release()?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Append a component. Its readable bytes join the logical range and its
    /// ownership unit transfers to the composite; the sender must no longer
    /// touch it.
    pub fn add_component(&mut self, buf: ByteBuf) -> Result<()> {
        self.check_accessible()?;
        let first = buf.reader_index();
        let len = buf.readable_bytes();
        let start = self.capacity();
        self.components.push(Component {
            buf,
            start,
            first,
            len,
        });
        self.writer += len;
        Ok(())
    }

    /// Number of components currently held.
    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Total logical capacity: the sum of component lengths.
    pub fn capacity(&self) -> usize {
        self.components.last().map_or(0, |c| c.start + c.len)
    }

    /// Current reader index.
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current writer index.
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Whether at least one byte can be read.
    pub fn is_readable(&self) -> bool {
        self.writer > self.reader
    }

    /// Index of the component covering the logical offset.
    fn component_index(&self, offset: usize) -> Result<usize> {
        if offset >= self.capacity() {
            return Err(Error::IndexOutOfBounds(format!(
                "offset {offset} exceeds {}",
                self.capacity()
            )));
        }
        // Binary search over start offsets: the covering component is the
        // last one whose start is <= offset.
        let idx = self
            .components
            .partition_point(|c| c.start <= offset);
        Ok(idx - 1)
    }

    /// Copy bytes at `index` into `dst` without moving cursors, crossing
    /// component boundaries as needed.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_accessible()?;
        if dst.is_empty() {
            return Ok(());
        }
        let end = index
            .checked_add(dst.len())
            .filter(|&e| e <= self.capacity())
            .ok_or_else(|| {
                Error::IndexOutOfBounds(format!(
                    "range {index}+{} exceeds {}",
                    dst.len(),
                    self.capacity()
                ))
            })?;
        let mut ci = self.component_index(index)?;
        let mut pos = index;
        let mut copied = 0;
        while pos < end {
            let comp = &self.components[ci];
            let in_comp = pos - comp.start;
            let n = (comp.len - in_comp).min(end - pos);
            comp.buf
                .get_bytes(comp.first + in_comp, &mut dst[copied..copied + n])?;
            pos += n;
            copied += n;
            ci += 1;
        }
        Ok(())
    }

    /// Copy `src` into the composite at `index`, crossing component
    /// boundaries as needed.
    pub fn set_bytes(&mut self, index: usize, src: &[u8]) -> Result<()> {
        self.check_accessible()?;
        if src.is_empty() {
            return Ok(());
        }
        let end = index
            .checked_add(src.len())
            .filter(|&e| e <= self.capacity())
            .ok_or_else(|| {
                Error::IndexOutOfBounds(format!(
                    "range {index}+{} exceeds {}",
                    src.len(),
                    self.capacity()
                ))
            })?;
        let mut ci = self.component_index(index)?;
        let mut pos = index;
        let mut copied = 0;
        while pos < end {
            let comp = &mut self.components[ci];
            let in_comp = pos - comp.start;
            let n = (comp.len - in_comp).min(end - pos);
            comp.buf
                .set_bytes(comp.first + in_comp, &src[copied..copied + n])?;
            pos += n;
            copied += n;
            ci += 1;
        }
        Ok(())
    }

    /// Byte at `index`.
    pub fn get_u8(&self, index: usize) -> Result<u8> {
        let mut out = [0u8; 1];
        self.get_bytes(index, &mut out)?;
        Ok(out[0])
    }

    /// Big-endian u16 at `index`, possibly spanning components.
    pub fn get_u16(&self, index: usize) -> Result<u16> {
        let mut out = [0u8; 2];
        self.get_bytes(index, &mut out)?;
        Ok(u16::from_be_bytes(out))
    }

    /// Big-endian u32 at `index`, possibly spanning components.
    pub fn get_u32(&self, index: usize) -> Result<u32> {
        let mut out = [0u8; 4];
        self.get_bytes(index, &mut out)?;
        Ok(u32::from_be_bytes(out))
    }

    /// Fill `dst` from the readable region, advancing the reader index.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.readable_bytes() < dst.len() {
            return Err(Error::IndexOutOfBounds(format!(
                "read {} exceeds {}",
                self.reader + dst.len(),
                self.writer
            )));
        }
        self.get_bytes(self.reader, dst)?;
        self.reader += dst.len();
        Ok(())
    }

    /// Append bytes as a new component allocated from this composite's
    /// allocator.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.check_accessible()?;
        if src.is_empty() {
            return Ok(());
        }
        let mut tail = self.alloc.buffer(src.len(), src.len())?;
        tail.write_bytes(src)?;
        self.add_component(tail)
    }

    /// Replace components `[from, to]` with a single copied buffer.
    pub fn consolidate(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_accessible()?;
        if from > to || to >= self.components.len() {
            return Err(Error::IndexOutOfBounds(format!(
                "component range {from}..={to} exceeds {}",
                self.components.len()
            )));
        }
        let total: usize = self.components[from..=to].iter().map(|c| c.len).sum();
        let mut merged = self.alloc.buffer(total, total)?;
        for comp in &self.components[from..=to] {
            let mut tmp = vec![0u8; comp.len];
            comp.buf.get_bytes(comp.first, &mut tmp)?;
            merged.write_bytes(&tmp)?;
        }
        let start = self.components[from].start;
        for comp in self.components.drain(from..=to) {
            comp.buf.release()?;
        }
        self.components.insert(
            from,
            Component {
                buf: merged,
                start,
                first: 0,
                len: total,
            },
        );
        // Offsets after the merged component are unchanged by construction.
        Ok(())
    }

    /// Drop components that lie entirely past the new capacity.
    pub fn truncate_capacity(&mut self, new_capacity: usize) -> Result<()> {
        self.check_accessible()?;
        while let Some(last) = self.components.last() {
            if last.start < new_capacity {
                break;
            }
            let comp = self.components.pop().unwrap();
            comp.buf.release()?;
        }
        let cap = self.capacity();
        self.writer = self.writer.min(cap);
        self.reader = self.reader.min(self.writer);
        Ok(())
    }

    /// Copy the readable region into a fresh `Vec` without moving cursors.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.readable_bytes()];
        self.get_bytes(self.reader, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for CompositeBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBuf")
            .field("components", &self.components.len())
            .field("ridx", &self.reader)
            .field("widx", &self.writer)
            .field("cap", &self.capacity())
            .field("refs", &self.ref_cnt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Allocator;

    fn component(alloc: &Allocator, bytes: &[u8]) -> ByteBuf {
        let mut b = alloc.heap(bytes.len(), bytes.len()).unwrap();
        b.write_bytes(bytes).unwrap();
        b
    }

    #[test]
    fn test_concatenation_law() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, b"hello ")).unwrap();
        c.add_component(component(&alloc, b"composite ")).unwrap();
        c.add_component(component(&alloc, b"world")).unwrap();
        assert_eq!(c.num_components(), 3);
        assert_eq!(c.capacity(), 21);
        // Reading the total length equals the components in order.
        let mut out = vec![0u8; 21];
        c.read_bytes(&mut out).unwrap();
        assert_eq!(out, b"hello composite world".to_vec());
        c.release().unwrap();
        assert_eq!(alloc.leak_detector().leaked(), 0);
    }

    #[test]
    fn test_reads_cross_component_boundaries() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, &[0x01])).unwrap();
        c.add_component(component(&alloc, &[0x02, 0x03])).unwrap();
        c.add_component(component(&alloc, &[0x04])).unwrap();
        assert_eq!(c.get_u32(0).unwrap(), 0x0102_0304);
        assert_eq!(c.get_u16(1).unwrap(), 0x0203);
        c.release().unwrap();
    }

    #[test]
    fn test_set_bytes_across_components() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, b"aaaa")).unwrap();
        c.add_component(component(&alloc, b"bbbb")).unwrap();
        c.set_bytes(2, b"XYZW").unwrap();
        assert_eq!(c.to_vec().unwrap(), b"aaXYZWbb".to_vec());
        c.release().unwrap();
    }

    #[test]
    fn test_release_frees_all_components_once() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, b"abc")).unwrap();
        c.add_component(component(&alloc, b"def")).unwrap();
        assert!(c.release().unwrap());
        assert!(matches!(
            c.release(),
            Err(Error::IllegalReferenceCount { count: 0 })
        ));
        assert!(matches!(
            c.get_u8(0),
            Err(Error::IllegalReferenceCount { count: 0 })
        ));
        assert_eq!(alloc.leak_detector().leaked(), 0);
    }

    #[test]
    fn test_consolidate_preserves_content() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, b"ab")).unwrap();
        c.add_component(component(&alloc, b"cd")).unwrap();
        c.add_component(component(&alloc, b"ef")).unwrap();
        c.consolidate(0, 1).unwrap();
        assert_eq!(c.num_components(), 2);
        assert_eq!(c.to_vec().unwrap(), b"abcdef".to_vec());
        c.release().unwrap();
        assert_eq!(alloc.leak_detector().leaked(), 0);
    }

    #[test]
    fn test_write_appends_component() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.write_bytes(b"one").unwrap();
        c.write_bytes(b"two").unwrap();
        assert_eq!(c.num_components(), 2);
        assert_eq!(c.to_vec().unwrap(), b"onetwo".to_vec());
        c.release().unwrap();
    }

    #[test]
    fn test_truncate_drops_tail_components() {
        let alloc = Allocator::for_tests();
        let mut c = alloc.compose();
        c.add_component(component(&alloc, b"abc")).unwrap();
        c.add_component(component(&alloc, b"def")).unwrap();
        c.truncate_capacity(3).unwrap();
        assert_eq!(c.num_components(), 1);
        assert_eq!(c.to_vec().unwrap(), b"abc".to_vec());
        c.release().unwrap();
        assert_eq!(alloc.leak_detector().leaked(), 0);
    }
}
