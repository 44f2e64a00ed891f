//! Sending buffers between "processes" over unix sockets.
//!
//! A second thread with its own socket end stands in for the peer process;
//! the descriptors still travel through the kernel with `SCM_RIGHTS`.

use hwbuffer::ipc;
use hwbuffer::prelude::*;
use hwbuffer::{TransportError, WireHandle};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn rgba(width: u32, height: u32) -> BufferDescriptor {
    BufferDescriptor::new(width, height, PixelFormat::R8G8B8A8Unorm)
        .with_usage(Usage::CPU_READ | Usage::CPU_WRITE)
}

fn fill(buffer: &HardwareBuffer, value: u8) {
    let mut session = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
    session.as_mut_slice().unwrap().fill(value);
    session.unlock().unwrap();
}

#[test]
fn test_round_trip_preserves_descriptor() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let descriptors = [
        rgba(64, 64),
        BufferDescriptor::new(33, 7, PixelFormat::R8G8B8Unorm)
            .with_usage(Usage::CPU_READ_OFTEN)
            .with_layers(3),
        BufferDescriptor::blob(12345).with_usage(Usage::CPU_WRITE | Usage::SENSOR_DIRECT_DATA),
    ];

    for desc in descriptors {
        let buffer = HardwareBuffer::allocate(&desc).unwrap();
        ipc::send(&buffer, &tx).unwrap();
        let received = ipc::receive(&rx).unwrap();

        assert_eq!(received.describe(), buffer.describe());
        assert_eq!(received.stride(), buffer.stride());
        assert_eq!(received.ref_count(), 1);
        assert!(!received.same_buffer(&buffer));
        // Sending kept the sender's reference.
        assert_eq!(buffer.ref_count(), 1);
    }
}

#[test]
fn test_memory_is_shared_not_copied() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let buffer = HardwareBuffer::allocate(&rgba(64, 64)).unwrap();
    fill(&buffer, 0x5A);

    let peer = thread::spawn(move || {
        let received = HardwareBuffer::receive_from(&rx).unwrap();
        let session = received.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        assert!(session.as_slice().iter().all(|&b| b == 0x5A));
        session.unlock().unwrap();

        // Write back through the peer's mapping.
        fill(&received, 0xC3);
        received
    });

    buffer.send_to(&tx).unwrap();
    let received = peer.join().unwrap();

    let session = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
    assert!(session.as_slice().iter().all(|&b| b == 0xC3));
    session.unlock().unwrap();
    drop(received);
}

#[test]
fn test_independent_lifetimes() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let sender_alloc = Arc::new(MemfdAllocator::new());
    let receiver_alloc = Arc::new(MemfdAllocator::new());

    let buffer = HardwareBuffer::allocate_with(sender_alloc.clone(), &rgba(16, 16)).unwrap();
    fill(&buffer, 9);
    ipc::send(&buffer, &tx).unwrap();
    let received = ipc::receive_with(receiver_alloc.clone(), &rx).unwrap();

    buffer.release();
    assert_eq!(sender_alloc.stats().live_handles, 0);
    assert_eq!(receiver_alloc.stats().imports, 1);

    // The receiver's duplicate keeps the memory alive.
    let session = received.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
    assert!(session.as_slice().iter().all(|&b| b == 9));
    session.unlock().unwrap();

    received.release();
    assert_eq!(receiver_alloc.stats().live_handles, 0);
}

#[test]
fn test_send_many_back_to_back() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let count = 32;

    let sender = thread::spawn(move || {
        for i in 0..count {
            let buffer = HardwareBuffer::allocate(&rgba(8 + i, 8)).unwrap();
            fill(&buffer, i as u8);
            ipc::send(&buffer, &tx).unwrap();
        }
    });

    for i in 0..count {
        let buffer = ipc::receive(&rx).unwrap();
        assert_eq!(buffer.describe().width, 8 + i);
        let session = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        assert!(session.as_slice().iter().all(|&b| b == i as u8));
        session.unlock().unwrap();
    }
    sender.join().unwrap();
}

#[test]
fn test_fence_travels_with_buffer() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let buffer = HardwareBuffer::allocate(&rgba(8, 8)).unwrap();
    let fence = Fence::new().unwrap();

    ipc::send_with_fence(&buffer, &fence, &tx).unwrap();
    let (received, received_fence) = ipc::receive_with_fence(&rx).unwrap();
    assert!(!received_fence.is_trivially_signaled());
    assert!(!received_fence.is_signaled().unwrap());

    let consumer = thread::spawn(move || {
        let session = received.lock(Usage::CPU_READ, received_fence, None).unwrap();
        let first = session.as_slice()[0];
        session.unlock().unwrap();
        first
    });

    thread::sleep(Duration::from_millis(10));
    fill(&buffer, 42);
    fence.signal().unwrap();
    assert_eq!(consumer.join().unwrap(), 42);
}

#[test]
fn test_signaled_fence_is_not_attached() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let buffer = HardwareBuffer::allocate(&rgba(8, 8)).unwrap();

    ipc::send_with_fence(&buffer, &Fence::signaled(), &tx).unwrap();
    let (_received, fence) = ipc::receive_with_fence(&rx).unwrap();
    assert!(fence.is_trivially_signaled());
}

#[test]
fn test_receive_garbage_is_malformed() {
    use std::io::Write;

    let (mut tx, rx) = UnixStream::pair().unwrap();
    tx.write_all(b"definitely not a wire handle").unwrap();
    assert!(matches!(
        ipc::receive(&rx),
        Err(TransportError::Malformed(_))
    ));
}

#[test]
fn test_rejected_message_is_consumed_whole() {
    use std::io::Write;

    let (mut tx, rx) = UnixStream::pair().unwrap();
    let buffer = HardwareBuffer::allocate(&rgba(8, 8)).unwrap();
    fill(&buffer, 0x3C);

    // A well-framed payload without its memory descriptor, then a real send.
    let wire = WireHandle::new(buffer.describe(), &buffer.layout()).unwrap();
    tx.write_all(&wire.encode()).unwrap();
    ipc::send(&buffer, &tx).unwrap();

    assert!(matches!(
        ipc::receive(&rx),
        Err(TransportError::Malformed(_))
    ));
    let received = ipc::receive(&rx).unwrap();
    assert_eq!(received.describe(), buffer.describe());
    let session = received.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
    assert!(session.as_slice().iter().all(|&b| b == 0x3C));
    session.unlock().unwrap();
}

#[test]
fn test_receive_after_peer_hangs_up() {
    let (tx, rx) = UnixStream::pair().unwrap();
    drop(tx);
    assert!(matches!(ipc::receive(&rx), Err(TransportError::Io(_))));
}
