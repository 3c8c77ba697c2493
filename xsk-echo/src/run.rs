//! # Receive / transform / transmit loop
//!
//! One iteration: optionally block on socket readiness, peek a batch of RX
//! descriptors, top up the Fill ring from the frame pool, rewrite each echo
//! request in place and hand the same frame to the TX ring, release the RX
//! slots, then kick the kernel and reclaim completed transmissions back into
//! the pool.
//!
//! Shortfalls from `reserve` and `peek` are backpressure, not errors: a full
//! TX ring drops the packet and returns its frame to the pool, an exhausted
//! pool simply caps replenishment until completions come back. The batch
//! steps are free functions over rings, pool and arena bytes so they run
//! against host-memory rings in tests.

use crate::mmap::frame_bytes;
use crate::packet;
use crate::pool::FramePool;
use crate::ring::{ConsumerRing, ProducerRing, XdpDesc};
use crate::socket::Socket;
use crate::stats::Stats;
use crate::{FRAME_COUNT, FRAME_SIZE};
use std::sync::Arc;
use std::time::Duration;
use std::{io, slice};
use tokio_util::sync::CancellationToken;

/// Poll timeout; bounds how long a quiet iteration can delay shutdown.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Stuffs the Fill ring at startup. The ring is fresh, so anything short of
/// a full grant is a setup failure, not backpressure.
pub(crate) fn prime_fill(fill: &mut ProducerRing<u64>, pool: &mut FramePool) -> io::Result<usize> {
    let want = fill.capacity().min(pool.available());
    let (granted, mut idx) = fill.reserve(want);
    if granted != want {
        return Err(io::Error::other(
            "fresh fill ring refused the initial reservation",
        ));
    }
    for _ in 0..granted {
        fill.write_slot(idx, pool.alloc());
        idx = idx.wrapping_add(1);
    }
    fill.submit(granted);
    Ok(granted)
}

/// Tops up the Fill ring with as many frames as both the ring and the pool
/// can supply right now. Capping at the pool stock means the invalid-frame
/// sentinel is never submitted into a Fill slot.
pub(crate) fn replenish_fill(fill: &mut ProducerRing<u64>, pool: &mut FramePool) -> usize {
    let stock = fill.free_slots(pool.available()).min(pool.available());
    if stock == 0 {
        return 0;
    }
    let (granted, mut idx) = fill.reserve(stock);
    for _ in 0..granted {
        fill.write_slot(idx, pool.alloc());
        idx = idx.wrapping_add(1);
    }
    fill.submit(granted);
    granted
}

/// Consumes one RX batch and forwards it. Returns `(received, transmitted)`;
/// the difference is the number of dropped packets, each of which had its
/// frame returned to the pool.
pub(crate) fn forward_batch(
    arena: &mut [u8],
    rx: &mut ConsumerRing<XdpDesc>,
    tx: &mut ProducerRing<XdpDesc>,
    fill: &mut ProducerRing<u64>,
    pool: &mut FramePool,
    stats: &Stats,
    batch: usize,
) -> (usize, usize) {
    let (rcvd, mut idx_rx) = rx.peek(batch);
    if rcvd == 0 {
        return (0, 0);
    }

    // Replenish before processing so the kernel keeps receiving while this
    // batch is transformed; the frames freed by the previous reclaim are the
    // ones consumed here.
    replenish_fill(fill, pool);

    let mut transmitted = 0;
    for _ in 0..rcvd {
        let desc = rx.read_slot(idx_rx);
        idx_rx = idx_rx.wrapping_add(1);
        stats.add_rx_bytes(desc.len as u64);

        let echoed = frame_bytes(arena, desc.addr, desc.len as usize)
            .is_some_and(|frame| packet::icmp_echo_reply(frame));
        if !echoed {
            log::debug!("dropping non-echo packet of {} bytes", desc.len);
            pool.free(desc.addr);
            continue;
        }

        let (granted, idx_tx) = tx.reserve(1);
        if granted != 1 {
            log::debug!("TX ring full, dropping packet");
            pool.free(desc.addr);
            continue;
        }
        // Ownership of the frame moves from the consumed RX descriptor to
        // the submitted TX descriptor; the payload is never copied.
        tx.write_slot(idx_tx, XdpDesc::new(desc.addr, desc.len));
        tx.submit(1);
        stats.add_tx(desc.len as u64);
        transmitted += 1;
    }

    rx.release(rcvd);
    stats.add_rx_packets(rcvd as u64);
    (rcvd, transmitted)
}

/// Drains the Completion ring, returning every completed frame to the pool.
pub(crate) fn reclaim_completions(
    completion: &mut ConsumerRing<u64>,
    pool: &mut FramePool,
    outstanding: &mut u32,
) -> usize {
    let (done, mut idx) = completion.peek(completion.capacity());
    for _ in 0..done {
        pool.free(completion.read_slot(idx));
        idx = idx.wrapping_add(1);
    }
    completion.release(done);
    *outstanding = outstanding.saturating_sub(done as u32);
    done
}

/// The echo responder: owns the socket, the frame pool and the traffic
/// counters, and runs the iteration until cancelled.
pub struct EchoLoop {
    socket: Socket,
    pool: FramePool,
    stats: Arc<Stats>,
    outstanding_tx: u32,
    batch_size: usize,
    poll_mode: bool,
}

impl EchoLoop {
    /// Wraps a freshly bound socket and primes its Fill ring so the kernel
    /// can deliver packets from the first iteration on.
    pub fn new(
        mut socket: Socket,
        stats: Arc<Stats>,
        batch_size: usize,
        poll_mode: bool,
    ) -> io::Result<EchoLoop> {
        let mut pool = FramePool::new(FRAME_COUNT, FRAME_SIZE);
        let primed = prime_fill(&mut socket.fill, &mut pool)?;
        log::info!(
            "fill ring primed with {} frames, {} left in the pool",
            primed,
            pool.available()
        );
        Ok(EchoLoop {
            socket,
            pool,
            stats,
            outstanding_tx: 0,
            batch_size,
            poll_mode,
        })
    }

    fn iterate(&mut self) -> io::Result<()> {
        if self.poll_mode && !self.socket.poll_wait(Some(POLL_TIMEOUT))? {
            return Ok(());
        }

        let arena = unsafe {
            slice::from_raw_parts_mut(self.socket.arena_ptr(), self.socket.arena_len())
        };
        let (_, sent) = forward_batch(
            arena,
            &mut self.socket.rx,
            &mut self.socket.tx,
            &mut self.socket.fill,
            &mut self.pool,
            &self.stats,
            self.batch_size,
        );
        self.outstanding_tx += sent as u32;

        if self.outstanding_tx > 0 {
            // In need-wakeup mode the flags word tells us whether the kernel
            // actually sleeps; without it every submission needs the kick.
            self.socket.wakeup(!self.socket.bound_with_need_wakeup())?;
            reclaim_completions(
                &mut self.socket.completion,
                &mut self.pool,
                &mut self.outstanding_tx,
            );
        }
        Ok(())
    }

    /// Runs until the token is cancelled; the current iteration always
    /// completes before the loop exits.
    pub fn run(&mut self, token: CancellationToken) -> io::Result<()> {
        while !token.is_cancelled() {
            self.iterate()?;
        }
        Ok(())
    }
}
