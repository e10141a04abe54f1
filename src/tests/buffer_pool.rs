use crate::pool::BufferPool;

#[test]
fn recycled_buffer_is_reused() {
    let mut pool = BufferPool::new(2);
    let buffer = pool.acquire(64);
    assert_eq!(pool.allocations(), 1);
    let ptr = buffer.as_ptr();
    pool.recycle(buffer);

    let again = pool.acquire(64);
    assert_eq!(again.as_ptr(), ptr);
    assert_eq!(pool.allocations(), 1);
    assert!(pool.is_empty());
}

#[test]
fn pool_never_exceeds_capacity() {
    let mut pool = BufferPool::new(2);
    let buffers: Vec<_> = (0..5).map(|_| pool.acquire(16)).collect();
    for buffer in buffers {
        pool.recycle(buffer);
    }
    assert_eq!(pool.len(), pool.capacity());
    assert_eq!(pool.allocations(), 5);
}

#[test]
fn wrong_sized_buffers_are_discarded() {
    let mut pool = BufferPool::new(2);
    pool.recycle(vec![0u8; 8]);
    pool.recycle(vec![0u8; 8]);

    let buffer = pool.acquire(32);
    assert_eq!(buffer.len(), 32);
    assert_eq!(pool.allocations(), 1);
    assert!(pool.is_empty());
}
