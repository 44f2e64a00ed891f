//! Handle transport over unix domain sockets.
//!
//! A buffer crosses a process boundary as one message: a small
//! little-endian payload (the [`WireHandle`]) plus the memory descriptor,
//! and optionally a fence descriptor, attached with `SCM_RIGHTS`. The kernel
//! duplicates the descriptors into the receiver, so each side owns its own
//! handle and releases it independently. Sending never consumes the
//! sender's reference.
//!
//! # Wire format (version 1)
//!
//! ```text
//! offset size field
//! 0      4    magic "HWBF"
//! 4      2    version
//! 6      2    attachment count (1..=4)
//! 8      2    descriptor section length (>= 40)
//! 10     2    reserved
//! 12     16*n attachment table: kind u32, reserved u32, size u64
//! ..     40   width u32, height u32, layers u32, format u32,
//!             usage0 u64, usage1 u64, stride u32, reserved u32
//! ```
//!
//! Readers skip descriptor bytes past the ones they know, so fields can be
//! appended without a version bump.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::os::unix::net::UnixStream;
//! use hwbuffer::{HardwareBuffer, ipc};
//!
//! let (tx, rx) = UnixStream::pair()?;
//! ipc::send(&buffer, &tx)?;
//!
//! // In the other process:
//! let received = ipc::receive(&rx)?;
//! assert_eq!(received.describe(), buffer.describe());
//! ```

use crate::buffer::HardwareBuffer;
use crate::descriptor::{BufferDescriptor, BufferLayout};
use crate::error::TransportError;
use crate::fence::Fence;
use crate::format::{PixelFormat, Usage};
use crate::memory::{Allocator, MemoryHandle, shared_allocator};
use crate::observability::{span_transport, trace_transfer};
use bytes::{Buf, BufMut, BytesMut};
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use smallvec::SmallVec;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Magic bytes at the start of every payload.
pub const WIRE_MAGIC: [u8; 4] = *b"HWBF";

/// Current wire format version.
pub const WIRE_VERSION: u16 = 1;

/// Maximum number of descriptors in one message.
pub const MAX_ATTACHMENTS: usize = 4;

const HEADER_LEN: usize = 12;
const ATTACHMENT_LEN: usize = 16;
const DESCRIPTOR_LEN: usize = 40;

/// What an attached descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachmentKind {
    /// The buffer's memory.
    Memory = 1,
    /// A fence guarding the memory.
    Fence = 2,
}

impl AttachmentKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Memory),
            2 => Some(Self::Fence),
            _ => None,
        }
    }
}

/// One entry of the attachment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Descriptor kind.
    pub kind: AttachmentKind,
    /// Bytes behind the descriptor (0 for fences).
    pub size: u64,
}

/// Serialized identity of a buffer, minus the descriptors themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHandle {
    /// The buffer descriptor.
    pub descriptor: BufferDescriptor,
    /// Row stride in bytes.
    pub stride: u32,
    /// Attachment table, in the order the descriptors are attached.
    pub attachments: SmallVec<[Attachment; MAX_ATTACHMENTS]>,
}

impl WireHandle {
    /// Wire handle for a buffer's memory alone.
    pub fn new(descriptor: BufferDescriptor, layout: &BufferLayout) -> Result<Self, TransportError> {
        let stride = u32::try_from(layout.stride).map_err(|_| {
            TransportError::InvalidBuffer(format!("stride {} does not fit the wire", layout.stride))
        })?;
        let mut attachments = SmallVec::new();
        attachments.push(Attachment {
            kind: AttachmentKind::Memory,
            size: layout.size as u64,
        });
        Ok(Self {
            descriptor,
            stride,
            attachments,
        })
    }

    /// Add a fence attachment.
    pub fn with_fence(mut self) -> Self {
        self.attachments.push(Attachment {
            kind: AttachmentKind::Fence,
            size: 0,
        });
        self
    }

    /// True if a fence descriptor travels with the memory.
    pub fn has_fence(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.kind == AttachmentKind::Fence)
    }

    /// Length of the encoded payload.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.attachments.len() * ATTACHMENT_LEN + DESCRIPTOR_LEN
    }

    /// Encode the payload.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&WIRE_MAGIC);
        buf.put_u16_le(WIRE_VERSION);
        buf.put_u16_le(self.attachments.len() as u16);
        buf.put_u16_le(DESCRIPTOR_LEN as u16);
        buf.put_u16_le(0);

        for attachment in &self.attachments {
            buf.put_u32_le(attachment.kind as u32);
            buf.put_u32_le(0);
            buf.put_u64_le(attachment.size);
        }

        let desc = &self.descriptor;
        buf.put_u32_le(desc.width);
        buf.put_u32_le(desc.height);
        buf.put_u32_le(desc.layers);
        buf.put_u32_le(desc.format.as_u32());
        buf.put_u64_le(desc.usage.bits());
        buf.put_u64_le(desc.usage1);
        buf.put_u32_le(self.stride);
        buf.put_u32_le(0);
        buf
    }

    /// Total payload length announced by a header.
    fn payload_len(header: &[u8]) -> Result<usize, TransportError> {
        if header.len() < HEADER_LEN {
            return Err(malformed(format!("short header: {} bytes", header.len())));
        }
        let mut buf = header;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != WIRE_MAGIC {
            return Err(malformed(format!("bad magic {magic:02x?}")));
        }
        let version = buf.get_u16_le();
        if version != WIRE_VERSION {
            return Err(malformed(format!("unsupported version {version}")));
        }
        let count = buf.get_u16_le() as usize;
        if count == 0 || count > MAX_ATTACHMENTS {
            return Err(malformed(format!("attachment count {count}")));
        }
        let descriptor_len = buf.get_u16_le() as usize;
        if descriptor_len < DESCRIPTOR_LEN {
            return Err(malformed(format!("descriptor section of {descriptor_len} bytes")));
        }
        Ok(HEADER_LEN + count * ATTACHMENT_LEN + descriptor_len)
    }

    /// Decode and validate a payload.
    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        let total = Self::payload_len(payload)?;
        if payload.len() < total {
            return Err(malformed(format!(
                "truncated payload: {} of {} bytes",
                payload.len(),
                total
            )));
        }

        let mut buf = &payload[6..total];
        let count = buf.get_u16_le() as usize;
        let descriptor_len = buf.get_u16_le() as usize;
        buf.advance(2);

        let mut attachments: SmallVec<[Attachment; MAX_ATTACHMENTS]> = SmallVec::new();
        for _ in 0..count {
            let raw = buf.get_u32_le();
            let kind = AttachmentKind::from_u32(raw)
                .ok_or_else(|| malformed(format!("unknown attachment kind {raw}")))?;
            buf.advance(4);
            attachments.push(Attachment {
                kind,
                size: buf.get_u64_le(),
            });
        }
        let memory = attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Memory)
            .count();
        let fences = attachments.len() - memory;
        if attachments[0].kind != AttachmentKind::Memory || memory != 1 || fences > 1 {
            return Err(malformed(format!("unexpected attachment table {attachments:?}")));
        }

        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let layers = buf.get_u32_le();
        let format = PixelFormat::try_from(buf.get_u32_le()).map_err(|e| malformed(e.to_string()))?;
        let usage = Usage::from_bits_retain(buf.get_u64_le());
        let usage1 = buf.get_u64_le();
        let stride = buf.get_u32_le();
        buf.advance(4);
        // Fields appended by newer writers.
        buf.advance(descriptor_len - DESCRIPTOR_LEN);

        let descriptor = BufferDescriptor {
            width,
            height,
            layers,
            format,
            usage,
            usage1,
        };
        // usage1 is carried, not interpreted.
        BufferDescriptor { usage1: 0, ..descriptor }
            .validate()
            .map_err(|e| malformed(e.to_string()))?;

        let wire = Self {
            descriptor,
            stride,
            attachments,
        };
        let layout = wire.layout()?;
        if wire.attachments[0].size != layout.size as u64 {
            return Err(malformed(format!(
                "memory size {} disagrees with layout size {}",
                wire.attachments[0].size, layout.size
            )));
        }
        Ok(wire)
    }

    /// Layout implied by the descriptor and stride.
    pub fn layout(&self) -> Result<BufferLayout, TransportError> {
        BufferLayout::with_stride(&self.descriptor, self.stride as usize)
            .map_err(|e| malformed(e.to_string()))
    }
}

fn malformed(message: impl Into<String>) -> TransportError {
    TransportError::Malformed(message.into())
}

/// Send a buffer. The caller keeps its reference.
pub fn send(buffer: &HardwareBuffer, socket: &UnixStream) -> Result<(), TransportError> {
    send_parts(buffer, None, socket)
}

/// Send a buffer together with a fence the receiver should wait on.
///
/// A trivially signaled fence is not attached; the receiver gets a signaled
/// fence back either way.
pub fn send_with_fence(
    buffer: &HardwareBuffer,
    fence: &Fence,
    socket: &UnixStream,
) -> Result<(), TransportError> {
    send_parts(buffer, Some(fence), socket)
}

/// Receive a buffer, registering its memory with the process-wide allocator.
///
/// Blocks until a message arrives. Any fence that came with it is closed.
///
/// A message with a valid header is consumed whole, even when it is rejected,
/// so the next receive starts at the next message. A header that fails to
/// parse leaves the stream out of frame; drop the socket after such a
/// [`TransportError::Malformed`].
pub fn receive(socket: &UnixStream) -> Result<HardwareBuffer, TransportError> {
    receive_with(shared_allocator(), socket)
}

/// Receive a buffer, registering its memory with `allocator`.
pub fn receive_with(
    allocator: Arc<dyn Allocator>,
    socket: &UnixStream,
) -> Result<HardwareBuffer, TransportError> {
    receive_parts(allocator, socket).map(|(buffer, _fence)| buffer)
}

/// Receive a buffer and the fence sent with it.
///
/// The fence is [`Fence::signaled()`] if the sender attached none.
pub fn receive_with_fence(socket: &UnixStream) -> Result<(HardwareBuffer, Fence), TransportError> {
    receive_parts(shared_allocator(), socket)
}

fn send_parts(
    buffer: &HardwareBuffer,
    fence: Option<&Fence>,
    socket: &UnixStream,
) -> Result<(), TransportError> {
    let _span = span_transport("send", socket.as_raw_fd()).entered();

    let handle = buffer.native_handle();
    let backing = handle
        .backing_size()
        .map_err(|e| TransportError::InvalidBuffer(format!("cannot inspect memory: {e}")))?;
    if backing < handle.size() as u64 {
        return Err(TransportError::InvalidBuffer(format!(
            "memory holds {} bytes, layout needs {}",
            backing,
            handle.size()
        )));
    }

    let mut wire = WireHandle::new(buffer.describe(), &buffer.layout())?;
    let mut fds: SmallVec<[BorrowedFd<'_>; MAX_ATTACHMENTS]> = SmallVec::new();
    fds.push(handle.fd());
    if let Some(fd) = fence.and_then(Fence::as_fd) {
        wire = wire.with_fence();
        fds.push(fd);
    }

    let payload = wire.encode();
    send_fds(socket, &fds, &payload)?;
    trace_transfer("send", buffer.id(), payload.len(), fds.len());
    Ok(())
}

fn receive_parts(
    allocator: Arc<dyn Allocator>,
    socket: &UnixStream,
) -> Result<(HardwareBuffer, Fence), TransportError> {
    let _span = span_transport("receive", socket.as_raw_fd()).entered();

    let (wire, fds) = recv_message(socket)?;
    let layout = wire.layout()?;

    let mut memory = None;
    let mut fence = Fence::signaled();
    for (attachment, fd) in wire.attachments.iter().zip(fds) {
        match attachment.kind {
            AttachmentKind::Memory => memory = Some(fd),
            AttachmentKind::Fence => fence = Fence::from_fd(fd),
        }
    }
    let memory = memory.ok_or_else(|| malformed("no memory attachment"))?;

    let handle = MemoryHandle::new(memory, wire.descriptor, layout);
    let handle = allocator
        .import(handle)
        .map_err(|e| TransportError::InvalidBuffer(e.to_string()))?;
    let buffer = HardwareBuffer::from_handle(allocator, handle);

    trace_transfer("receive", buffer.id(), wire.encoded_len(), wire.attachments.len());
    Ok((buffer, fence))
}

/// Send a payload with descriptors attached to its first byte.
fn send_fds(socket: &UnixStream, fds: &[BorrowedFd<'_>], data: &[u8]) -> Result<(), TransportError> {
    if fds.len() > MAX_ATTACHMENTS {
        return Err(TransportError::InvalidBuffer(format!(
            "too many descriptors: {} > {}",
            fds.len(),
            MAX_ATTACHMENTS
        )));
    }

    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);
    if !ancillary.push(SendAncillaryMessage::ScmRights(fds)) {
        return Err(TransportError::InvalidBuffer(
            "descriptors do not fit the ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    let sent = loop {
        match sendmsg(socket, &iov, &mut ancillary, SendFlags::NOSIGNAL) {
            Err(Errno::INTR) => continue,
            result => break result?,
        }
    };

    // Stream sockets may take the payload in pieces; the descriptors went
    // with the first one.
    if sent < data.len() {
        let mut writer = socket;
        writer.write_all(&data[sent..])?;
    }
    Ok(())
}

/// Receive one message and the descriptors attached to it.
///
/// Descriptors are owned as soon as they arrive, so every error path
/// closes them.
fn recv_message(
    socket: &UnixStream,
) -> Result<(WireHandle, SmallVec<[OwnedFd; MAX_ATTACHMENTS]>), TransportError> {
    let mut header = [0u8; HEADER_LEN];
    let mut ancillary_space: [MaybeUninit<u8>; 64] = [const { MaybeUninit::uninit() }; 64];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    // Read only the header first so a following message is never consumed.
    let received = loop {
        let mut iov = [IoSliceMut::new(&mut header)];
        match recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC) {
            Err(Errno::INTR) => continue,
            result => break result?,
        }
    };

    let mut fds: SmallVec<[OwnedFd; MAX_ATTACHMENTS]> = SmallVec::new();
    for message in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = message {
            fds.extend(rights);
        }
    }

    if received.bytes == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the socket").into());
    }

    let mut reader = socket;
    if received.bytes < HEADER_LEN {
        reader.read_exact(&mut header[received.bytes..])?;
    }
    // Unknown length past a bad header: nothing more can be consumed.
    let total = WireHandle::payload_len(&header)?;
    let mut payload = vec![0u8; total];
    payload[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut payload[HEADER_LEN..])?;

    if received.flags.contains(ReturnFlags::CTRUNC) {
        return Err(malformed("ancillary data truncated"));
    }
    let wire = WireHandle::decode(&payload)?;
    if fds.len() != wire.attachments.len() {
        return Err(malformed(format!(
            "{} attachments announced, {} descriptors received",
            wire.attachments.len(),
            fds.len()
        )));
    }
    Ok((wire, fds))
}

impl HardwareBuffer {
    /// Send this buffer over `socket`. See [`send`].
    pub fn send_to(&self, socket: &UnixStream) -> Result<(), TransportError> {
        send(self, socket)
    }

    /// Receive a buffer from `socket`. See [`receive`].
    pub fn receive_from(socket: &UnixStream) -> Result<Self, TransportError> {
        receive(socket)
    }
}
