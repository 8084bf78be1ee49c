//! Remote-Op Handlers - Server Side of the Message Engine
//!
//! One handler task owns one accepted socket and loops reading frames,
//! executing each against the local region and allocator and replying on
//! the same socket. Requests whose pointer does not translate are silently
//! discarded; a well-formed client never sends an unreachable translation.
//! The task exits when the peer closes the connection.

use crate::allocator::DEFAULT_ALIGNMENT;
use crate::comm::wire::{self, Frame, MsgType};
use crate::ptr::GlobalPtr;
use crate::region::cacheline;
use crate::runtime::NodeCore;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Service loop for one accepted connection
pub(crate) fn serve(sock: TcpStream, core: Arc<NodeCore>) {
    let peer = sock
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "?".to_string());

    loop {
        let request = match wire::read_frame(&mut &sock) {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    log::debug!("handler {}: read failed: {}", peer, e);
                }
                break;
            }
        };

        if let Some(response) = dispatch(&core, &request) {
            if let Err(e) = wire::write_frame(&mut &sock, &response) {
                log::debug!("handler {}: reply failed: {}", peer, e);
                break;
            }
        }
    }

    log::debug!("handler {}: connection closed", peer);
}

/// Execute one request, producing its reply frame if the kind has one
fn dispatch(core: &NodeCore, request: &Frame) -> Option<Frame> {
    match request.msg_type {
        MsgType::Get => {
            let len = request.size as usize;
            core.segments.translate_range(request.ptr, len).ok().map(|_| {
                let mut response = reply(core, request, MsgType::GetResp);
                let mut payload = vec![0u8; len];
                // Translation validated the range
                let _ = core.region.read(request.ptr.offset, &mut payload);
                response.size = request.size;
                response.payload = payload;
                response
            })
        }

        MsgType::Put => {
            if request.payload.len() as u64 != request.size {
                log::debug!(
                    "discarding put with {} payload bytes for size {}",
                    request.payload.len(),
                    request.size
                );
                return None;
            }
            match core.segments.translate_range(request.ptr, request.payload.len()) {
                Ok(addr) => {
                    let _ = core.region.write(request.ptr.offset, &request.payload);
                    cacheline::flush(addr, request.payload.len());
                    Some(reply(core, request, MsgType::PutResp))
                }
                Err(_) => None,
            }
        }

        MsgType::AtomicFaa => match core.segments.translate_range(request.ptr, 8) {
            Ok(_) => {
                let word = core.region.atomic_u64(request.ptr.offset).ok()?;
                let prior = word.fetch_add(request.value, Ordering::SeqCst);
                let mut response = reply(core, request, MsgType::AtomicResp);
                response.value = prior;
                Some(response)
            }
            Err(_) => None,
        },

        MsgType::AtomicCas => match core.segments.translate_range(request.ptr, 8) {
            Ok(_) => {
                let word = core.region.atomic_u64(request.ptr.offset).ok()?;
                // Expected travels in value, desired in size
                let prior = match word.compare_exchange(
                    request.value,
                    request.size,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(prior) => prior,
                    Err(prior) => prior,
                };
                let mut response = reply(core, request, MsgType::AtomicResp);
                response.value = prior;
                Some(response)
            }
            Err(_) => None,
        },

        MsgType::Alloc => {
            let mut response = reply(core, request, MsgType::AllocResp);
            response.ptr = match core
                .allocator
                .alloc(request.size as usize, DEFAULT_ALIGNMENT)
            {
                Ok(offset) => GlobalPtr::new(core.local_id, offset),
                Err(e) => {
                    log::debug!("remote alloc of {} bytes failed: {}", request.size, e);
                    GlobalPtr::null()
                }
            };
            Some(response)
        }

        MsgType::Free => {
            if core.segments.translate(request.ptr).is_ok() {
                if let Err(e) = core.allocator.free(request.ptr.offset) {
                    log::warn!("remote free of {} failed: {}", request.ptr, e);
                }
            }
            None
        }

        MsgType::Barrier => Some(reply(core, request, MsgType::BarrierResp)),

        // Release round of a peer's barrier
        MsgType::BarrierResp => None,

        MsgType::GetResp
        | MsgType::PutResp
        | MsgType::AtomicResp
        | MsgType::AllocResp => {
            log::warn!(
                "unexpected {:?} frame on service socket from node {}",
                request.msg_type,
                request.src
            );
            None
        }
    }
}

fn reply(core: &NodeCore, request: &Frame, msg_type: MsgType) -> Frame {
    Frame::new(msg_type, core.local_id, request.src, request.request_id)
}
