//! Reference-counted byte buffers.
//!
//! A `ByteBuf` is an ordered byte region with two cursors, the reader and
//! writer indices, bounded by `capacity <= max_capacity`:
//!
//! ```text
//! 0 <= reader_index <= writer_index <= capacity <= max_capacity
//! ```
//!
//! The invariant holds after every operation. Buffers start with reference
//! count 1; `retain` adds a unit of ownership, `release` removes one, and
//! count zero frees the memory exactly once. Slices and duplicates share the
//! root memory and its count with independent indices. Indexed `get_*`/`set_*`
//! never move cursors; sequential `read_*`/`write_*` advance them. Writes grow
//! the buffer up to `max_capacity`, beyond which they fail without moving any
//! index.

pub(crate) mod allocator;
pub(crate) mod arena;
mod composite;
pub(crate) mod leak;

pub use allocator::{Allocator, AllocatorType};
pub use composite::CompositeBuf;
pub use leak::{LeakDetector, LeakLevel};

use crate::error::{Error, Result};
use allocator::{calculate_new_capacity, RootMem};
use std::fmt;
use std::sync::Arc;

/// A reference-counted byte buffer.
pub struct ByteBuf {
    root: Arc<RootMem>,
    /// Base of this view within the root region; 0 for root buffers.
    offset: usize,
    /// View window length. Ignored for root buffers, whose capacity follows
    /// the root region.
    window: usize,
    is_view: bool,
    reader: usize,
    writer: usize,
    marked_reader: usize,
    max_capacity: usize,
    read_only: bool,
    direct: bool,
    alloc: Allocator,
}

impl ByteBuf {
    pub(crate) fn new_root(root: Arc<RootMem>, max_capacity: usize, alloc: Allocator) -> ByteBuf {
        let direct = root.is_direct();
        ByteBuf {
            root,
            offset: 0,
            window: 0,
            is_view: false,
            reader: 0,
            writer: 0,
            marked_reader: 0,
            max_capacity,
            read_only: false,
            direct,
            alloc,
        }
    }

    fn new_view(&self, offset: usize, window: usize, read_only: bool) -> ByteBuf {
        ByteBuf {
            root: Arc::clone(&self.root),
            offset,
            window,
            is_view: true,
            reader: 0,
            writer: 0,
            marked_reader: 0,
            // A view cannot grow past its window.
            max_capacity: window,
            read_only,
            direct: self.direct,
            alloc: self.alloc.clone(),
        }
    }

    // ---- capacity and cursors ----

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        if self.is_view {
            self.window
        } else {
            self.root.cap().min(self.max_capacity)
        }
    }

    /// Upper bound the buffer may grow to.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Current reader index.
    pub fn reader_index(&self) -> usize {
        self.reader
    }

    /// Current writer index.
    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Move the reader index.
    pub fn set_reader_index(&mut self, index: usize) -> Result<()> {
        if index > self.writer {
            return Err(self.out_of_bounds("reader", index, self.writer));
        }
        self.reader = index;
        Ok(())
    }

    /// Move the writer index.
    pub fn set_writer_index(&mut self, index: usize) -> Result<()> {
        if index < self.reader || index > self.capacity() {
            return Err(self.out_of_bounds("writer", index, self.capacity()));
        }
        self.writer = index;
        Ok(())
    }

    /// Set both cursors at once.
    pub fn set_index(&mut self, reader: usize, writer: usize) -> Result<()> {
        if reader > writer || writer > self.capacity() {
            return Err(self.out_of_bounds("index pair", writer, self.capacity()));
        }
        self.reader = reader;
        self.writer = writer;
        Ok(())
    }

    /// Bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Bytes writable without growing.
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer
    }

    /// Bytes writable after growing to `max_capacity`.
    pub fn max_writable_bytes(&self) -> usize {
        self.max_capacity - self.writer
    }

    /// Whether at least one byte can be read.
    pub fn is_readable(&self) -> bool {
        self.writer > self.reader
    }

    /// Reset both cursors to zero. Contents are untouched.
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
        self.marked_reader = 0;
    }

    /// Remember the reader index for a later `reset_reader_index`.
    pub fn mark_reader_index(&mut self) {
        self.marked_reader = self.reader;
    }

    /// Rewind the reader index to the last mark.
    pub fn reset_reader_index(&mut self) -> Result<()> {
        let marked = self.marked_reader;
        self.set_reader_index(marked)
    }

    /// Drop already-read bytes, moving `[reader, writer)` to offset 0.
    pub fn discard_read_bytes(&mut self) -> Result<()> {
        self.root.check_accessible()?;
        if self.reader == 0 {
            return Ok(());
        }
        let readable = self.readable_bytes();
        if readable > 0 {
            unsafe {
                let base = self.root.ptr().add(self.offset);
                std::ptr::copy(base.add(self.reader), base, readable);
            }
        }
        self.marked_reader = self.marked_reader.saturating_sub(self.reader);
        self.reader = 0;
        self.writer = readable;
        Ok(())
    }

    // ---- reference counting ----

    /// Current reference count.
    pub fn ref_cnt(&self) -> usize {
        self.root.ref_cnt()
    }

    /// Add one unit of ownership.
    pub fn retain(&self) -> Result<()> {
        self.root.try_retain(1)?;
        if let Some(leak) = self.root.leak() {
            leak.touch("retain");
        }
        Ok(())
    }

    /// Drop one unit of ownership. Returns true when this release freed the
    /// memory. Releasing a count-zero buffer is an error.
    pub fn release(&self) -> Result<bool> {
        if let Some(leak) = self.root.leak() {
            leak.touch("release");
        }
        self.root.try_release()
    }

    /// Whether the buffer is still accessible (count above zero).
    pub fn is_accessible(&self) -> bool {
        self.root.ref_cnt() > 0
    }

    // ---- type queries ----

    /// Whether the bytes live off the Rust heap with a stable address.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Whether mutation is refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Raw address of the first byte, for kernel submission.
    pub fn memory_address(&self) -> Result<*mut u8> {
        self.root.check_accessible()?;
        Ok(unsafe { self.root.ptr().add(self.offset) })
    }

    /// Pointer and length of the readable region.
    pub(crate) fn readable_parts(&self) -> Result<(*const u8, usize)> {
        self.root.check_accessible()?;
        let ptr = unsafe { self.root.ptr().add(self.offset + self.reader) };
        Ok((ptr as *const u8, self.readable_bytes()))
    }

    // ---- views ----

    /// A view over `[index, index + len)` sharing memory and count. Its
    /// cursors run 0..len independently of this buffer's.
    pub fn slice(&self, index: usize, len: usize) -> Result<ByteBuf> {
        self.check_range(index, len)?;
        if let Some(leak) = self.root.leak() {
            leak.touch("slice");
        }
        let mut view = self.new_view(self.offset + index, len, self.read_only);
        view.writer = len;
        Ok(view)
    }

    /// `slice` plus one retained unit of ownership.
    pub fn retained_slice(&self, index: usize, len: usize) -> Result<ByteBuf> {
        let view = self.slice(index, len)?;
        self.root.try_retain(1)?;
        Ok(view)
    }

    /// A whole-buffer view with independent cursors, sharing memory and count.
    pub fn duplicate(&self) -> Result<ByteBuf> {
        self.root.check_accessible()?;
        let cap = self.capacity();
        let mut view = self.new_view(self.offset, cap, self.read_only);
        view.reader = self.reader;
        view.writer = self.writer;
        Ok(view)
    }

    /// `duplicate` plus one retained unit of ownership.
    pub fn retained_duplicate(&self) -> Result<ByteBuf> {
        let view = self.duplicate()?;
        self.root.try_retain(1)?;
        Ok(view)
    }

    /// A read-only view of the whole buffer.
    pub fn as_read_only(&self) -> Result<ByteBuf> {
        let mut view = self.duplicate()?;
        view.read_only = true;
        Ok(view)
    }

    /// Read `len` bytes as a shared view, advancing the reader index.
    pub fn read_slice(&mut self, len: usize) -> Result<ByteBuf> {
        self.check_readable(len)?;
        let view = self.slice(self.reader, len)?;
        self.reader += len;
        Ok(view)
    }

    /// Read `len` bytes as a retained view, advancing the reader index.
    pub fn read_retained_slice(&mut self, len: usize) -> Result<ByteBuf> {
        self.check_readable(len)?;
        let view = self.retained_slice(self.reader, len)?;
        self.reader += len;
        Ok(view)
    }

    // ---- indexed access ----

    fn check_range(&self, index: usize, len: usize) -> Result<()> {
        self.root.check_accessible()?;
        let end = index
            .checked_add(len)
            .ok_or_else(|| self.out_of_bounds("range", index, self.capacity()))?;
        if end > self.capacity() {
            return Err(self.out_of_bounds("range", end, self.capacity()));
        }
        Ok(())
    }

    fn check_writable_range(&self, index: usize, len: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        self.check_range(index, len)
    }

    fn out_of_bounds(&self, what: &str, index: usize, bound: usize) -> Error {
        Error::IndexOutOfBounds(format!("{what} {index} exceeds {bound}"))
    }

    unsafe fn abs_ptr(&self, index: usize) -> *mut u8 {
        self.root.ptr().add(self.offset + index)
    }

    fn get_array<const N: usize>(&self, index: usize) -> Result<[u8; N]> {
        self.check_range(index, N)?;
        let mut out = [0u8; N];
        unsafe {
            std::ptr::copy_nonoverlapping(self.abs_ptr(index), out.as_mut_ptr(), N);
        }
        Ok(out)
    }

    fn set_array<const N: usize>(&mut self, index: usize, bytes: [u8; N]) -> Result<()> {
        self.check_writable_range(index, N)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.abs_ptr(index), N);
        }
        Ok(())
    }

    /// Copy bytes at `index` into `dst` without moving cursors.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(index, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.abs_ptr(index), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the buffer at `index` without moving cursors.
    pub fn set_bytes(&mut self, index: usize, src: &[u8]) -> Result<()> {
        self.check_writable_range(index, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.abs_ptr(index), src.len());
        }
        Ok(())
    }

    /// Byte at `index`.
    pub fn get_u8(&self, index: usize) -> Result<u8> {
        Ok(self.get_array::<1>(index)?[0])
    }

    /// Signed byte at `index`.
    pub fn get_i8(&self, index: usize) -> Result<i8> {
        Ok(self.get_u8(index)? as i8)
    }

    /// Big-endian u16 at `index`.
    pub fn get_u16(&self, index: usize) -> Result<u16> {
        Ok(u16::from_be_bytes(self.get_array(index)?))
    }

    /// Little-endian u16 at `index`.
    pub fn get_u16_le(&self, index: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_array(index)?))
    }

    /// Big-endian i16 at `index`.
    pub fn get_i16(&self, index: usize) -> Result<i16> {
        Ok(self.get_u16(index)? as i16)
    }

    /// Big-endian u32 at `index`.
    pub fn get_u32(&self, index: usize) -> Result<u32> {
        Ok(u32::from_be_bytes(self.get_array(index)?))
    }

    /// Little-endian u32 at `index`.
    pub fn get_u32_le(&self, index: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array(index)?))
    }

    /// Big-endian i32 at `index`.
    pub fn get_i32(&self, index: usize) -> Result<i32> {
        Ok(self.get_u32(index)? as i32)
    }

    /// Big-endian u64 at `index`.
    pub fn get_u64(&self, index: usize) -> Result<u64> {
        Ok(u64::from_be_bytes(self.get_array(index)?))
    }

    /// Little-endian u64 at `index`.
    pub fn get_u64_le(&self, index: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_array(index)?))
    }

    /// Big-endian i64 at `index`.
    pub fn get_i64(&self, index: usize) -> Result<i64> {
        Ok(self.get_u64(index)? as i64)
    }

    /// Write a byte at `index`.
    pub fn set_u8(&mut self, index: usize, v: u8) -> Result<()> {
        self.set_array(index, [v])
    }

    /// Write a signed byte at `index`.
    pub fn set_i8(&mut self, index: usize, v: i8) -> Result<()> {
        self.set_u8(index, v as u8)
    }

    /// Write a big-endian u16 at `index`.
    pub fn set_u16(&mut self, index: usize, v: u16) -> Result<()> {
        self.set_array(index, v.to_be_bytes())
    }

    /// Write a little-endian u16 at `index`.
    pub fn set_u16_le(&mut self, index: usize, v: u16) -> Result<()> {
        self.set_array(index, v.to_le_bytes())
    }

    /// Write a big-endian i16 at `index`.
    pub fn set_i16(&mut self, index: usize, v: i16) -> Result<()> {
        self.set_u16(index, v as u16)
    }

    /// Write a big-endian u32 at `index`.
    pub fn set_u32(&mut self, index: usize, v: u32) -> Result<()> {
        self.set_array(index, v.to_be_bytes())
    }

    /// Write a little-endian u32 at `index`.
    pub fn set_u32_le(&mut self, index: usize, v: u32) -> Result<()> {
        self.set_array(index, v.to_le_bytes())
    }

    /// Write a big-endian i32 at `index`.
    pub fn set_i32(&mut self, index: usize, v: i32) -> Result<()> {
        self.set_u32(index, v as u32)
    }

    /// Write a big-endian u64 at `index`.
    pub fn set_u64(&mut self, index: usize, v: u64) -> Result<()> {
        self.set_array(index, v.to_be_bytes())
    }

    /// Write a little-endian u64 at `index`.
    pub fn set_u64_le(&mut self, index: usize, v: u64) -> Result<()> {
        self.set_array(index, v.to_le_bytes())
    }

    /// Write a big-endian i64 at `index`.
    pub fn set_i64(&mut self, index: usize, v: i64) -> Result<()> {
        self.set_u64(index, v as u64)
    }

    // ---- sequential access ----

    fn check_readable(&self, len: usize) -> Result<()> {
        self.root.check_accessible()?;
        if self.readable_bytes() < len {
            return Err(self.out_of_bounds(
                "read",
                self.reader + len,
                self.writer,
            ));
        }
        Ok(())
    }

    /// Grow so that `len` more bytes fit, up to `max_capacity`. Fails with
    /// `IndexOutOfBounds` beyond that, without moving any index.
    pub fn ensure_writable(&mut self, len: usize) -> Result<()> {
        self.root.check_accessible()?;
        if self.read_only {
            return Err(Error::ReadOnlyBuffer);
        }
        let needed = self
            .writer
            .checked_add(len)
            .ok_or_else(|| self.out_of_bounds("write", usize::MAX, self.max_capacity))?;
        if needed <= self.capacity() {
            return Ok(());
        }
        if self.is_view || needed > self.max_capacity {
            return Err(self.out_of_bounds("write", needed, self.max_capacity));
        }
        let new_cap = calculate_new_capacity(needed, self.max_capacity);
        let new_mem = self.alloc.new_mem(new_cap, self.direct)?;
        // Keep [reader, writer) at the same offsets in the new region.
        let readable = self.readable_bytes();
        if readable > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.root.ptr().add(self.reader),
                    new_mem.ptr().add(self.reader),
                    readable,
                );
            }
        }
        let old = unsafe { self.root.swap_mem(new_mem) };
        self.root.free_replaced(old);
        Ok(())
    }

    /// Read a byte, advancing the reader index.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.check_readable(1)?;
        let v = self.get_u8(self.reader)?;
        self.reader += 1;
        Ok(v)
    }

    /// Read a big-endian u16, advancing the reader index.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.check_readable(2)?;
        let v = self.get_u16(self.reader)?;
        self.reader += 2;
        Ok(v)
    }

    /// Read a big-endian u32, advancing the reader index.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.check_readable(4)?;
        let v = self.get_u32(self.reader)?;
        self.reader += 4;
        Ok(v)
    }

    /// Read a big-endian u64, advancing the reader index.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.check_readable(8)?;
        let v = self.get_u64(self.reader)?;
        self.reader += 8;
        Ok(v)
    }

    /// Fill `dst` from the readable region, advancing the reader index.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_readable(dst.len())?;
        self.get_bytes(self.reader, dst)?;
        self.reader += dst.len();
        Ok(())
    }

    /// Skip `len` readable bytes.
    pub fn skip_bytes(&mut self, len: usize) -> Result<()> {
        self.check_readable(len)?;
        self.reader += len;
        Ok(())
    }

    /// Write a byte, advancing the writer index.
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.ensure_writable(1)?;
        self.set_u8(self.writer, v)?;
        self.writer += 1;
        Ok(())
    }

    /// Write a big-endian u16, advancing the writer index.
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.ensure_writable(2)?;
        self.set_u16(self.writer, v)?;
        self.writer += 2;
        Ok(())
    }

    /// Write a big-endian u32, advancing the writer index.
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.ensure_writable(4)?;
        self.set_u32(self.writer, v)?;
        self.writer += 4;
        Ok(())
    }

    /// Write a big-endian u64, advancing the writer index.
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.ensure_writable(8)?;
        self.set_u64(self.writer, v)?;
        self.writer += 8;
        Ok(())
    }

    /// Append `src`, advancing the writer index.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        self.set_bytes(self.writer, src)?;
        self.writer += src.len();
        Ok(())
    }

    /// Append `len` zero bytes.
    pub fn write_zeroes(&mut self, len: usize) -> Result<()> {
        self.ensure_writable(len)?;
        unsafe {
            std::ptr::write_bytes(self.abs_ptr(self.writer), 0, len);
        }
        self.writer += len;
        Ok(())
    }

    /// Move the readable bytes of `src` into this buffer.
    pub fn write_byte_buf(&mut self, src: &mut ByteBuf) -> Result<()> {
        let len = src.readable_bytes();
        self.ensure_writable(len)?;
        let mut tmp = vec![0u8; len];
        src.read_bytes(&mut tmp)?;
        self.write_bytes(&tmp)
    }

    /// Copy the readable region into a fresh `Vec` without moving cursors.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.readable_bytes()];
        self.get_bytes(self.reader, &mut out)?;
        Ok(out)
    }

    /// The number of bytes the kernel may write at the writer index, with
    /// the pointer to hand it.
    pub(crate) fn writable_parts(&mut self) -> Result<(*mut u8, usize)> {
        self.root.check_accessible()?;
        let len = self.writable_bytes();
        let ptr = unsafe { self.abs_ptr(self.writer) };
        Ok((ptr, len))
    }

    /// Advance the writer index after the kernel filled `n` bytes.
    pub(crate) fn advance_writer(&mut self, n: usize) -> Result<()> {
        let writer = self.writer + n;
        self.set_writer_index(writer)
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("ridx", &self.reader)
            .field("widx", &self.writer)
            .field("cap", &self.capacity())
            .field("refs", &self.ref_cnt())
            .field("direct", &self.direct)
            .finish()
    }
}
