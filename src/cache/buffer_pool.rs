use std::sync::Mutex;

/// Fixed-size block allocator collaborator. The cache never allocates raw
/// memory itself — every buffer it holds came from here, and every buffer it
/// releases goes back here, preferably batched (spec §5: "batched returns are
/// always preferred over single-frees where possible to amortize allocator
/// overhead").
pub trait BufferPool: Send + Sync {
    /// Allocates one block-sized buffer, or `None` if the pool is exhausted.
    /// `tag` is a short label for diagnostics (`"send buffer"`,
    /// `"pending read"`, ...), matching the original allocator's debug
    /// category tagging.
    fn allocate_buffer(&self, tag: &'static str) -> Option<Vec<u8>>;

    fn free_buffer(&self, buf: Vec<u8>);

    fn free_multiple_buffers(&self, bufs: Vec<Vec<u8>>);

    /// Total buffers currently checked out of the pool.
    fn in_use(&self) -> usize;
}

/// A simple block-sized pool over a free list, used by the demo binary and
/// by tests. A production disk subsystem would back this with a real slab
/// allocator; the cache only depends on the trait above.
pub struct SimpleBufferPool {
    block_size: usize,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    free: Vec<Vec<u8>>,
    in_use: usize,
}

impl SimpleBufferPool {
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
            inner: Mutex::new(Inner {
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }
}

impl BufferPool for SimpleBufferPool {
    fn allocate_buffer(&self, tag: &'static str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use >= self.capacity {
            tracing::trace!(tag, capacity = self.capacity, "buffer pool exhausted");
            return None;
        }
        let buf = inner.free.pop().unwrap_or_else(|| vec![0u8; self.block_size]);
        inner.in_use += 1;
        Some(buf)
    }

    fn free_buffer(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use = inner.in_use.saturating_sub(1);
        inner.free.push(buf);
    }

    fn free_multiple_buffers(&self, bufs: Vec<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use = inner.in_use.saturating_sub(bufs.len());
        inner.free.extend(bufs);
    }

    fn in_use(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_up_to_capacity() {
        let pool = SimpleBufferPool::new(16384, 2);
        let a = pool.allocate_buffer("a").unwrap();
        let _b = pool.allocate_buffer("b").unwrap();
        assert!(pool.allocate_buffer("c").is_none());
        assert_eq!(pool.in_use(), 2);
        pool.free_buffer(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.allocate_buffer("d").is_some());
    }

    #[test]
    fn batched_free_reduces_in_use_once() {
        let pool = SimpleBufferPool::new(16384, 4);
        let bufs: Vec<_> = (0..3).map(|_| pool.allocate_buffer("x").unwrap()).collect();
        assert_eq!(pool.in_use(), 3);
        pool.free_multiple_buffers(bufs);
        assert_eq!(pool.in_use(), 0);
    }
}
