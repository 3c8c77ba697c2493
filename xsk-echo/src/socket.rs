//! # AF_XDP socket setup
//!
//! Creates the raw AF_XDP socket, registers the UMEM arena, sizes and maps
//! the four rings and binds the socket to a device queue. The kernel-side
//! redirect program that steers packets into this socket is external; this
//! module only consumes the socket handle it feeds.
//!
//! All setup failures are fatal and carry context; after `Socket::new`
//! returns, the only syscalls on the hot path are the optional `poll` and the
//! zero-length `sendto` wakeup.

use crate::mmap::OwnedMmap;
use crate::ring::{ConsumerRing, ProducerRing, RingType, XdpDesc};
use crate::{DEFAULT_RING_SIZE, FRAME_COUNT, FRAME_SIZE};
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::time::Duration;
use std::{io, ptr};

/// Socket creation options.
#[derive(Debug, Copy, Clone, Default)]
pub struct XskConfig {
    /// `Some(true)` forces `XDP_ZEROCOPY`, `Some(false)` forces `XDP_COPY`,
    /// `None` lets the kernel pick.
    pub zero_copy: Option<bool>,
    /// Back the arena with 2MB huge pages; `None` probes availability.
    pub huge_page: Option<bool>,
    /// Bind with `XDP_USE_NEED_WAKEUP` (default on). When set, the kernel
    /// only needs a kick when it flags the ring.
    pub need_wakeup: Option<bool>,
}

/// An AF_XDP socket bound to one device queue, together with its UMEM arena
/// and the four rings.
pub struct Socket {
    pub rx: ConsumerRing<XdpDesc>,
    pub tx: ProducerRing<XdpDesc>,
    pub fill: ProducerRing<u64>,
    pub completion: ConsumerRing<u64>,
    umem: OwnedMmap,
    fd: OwnedFd,
    need_wakeup: bool,
}

// The ring and arena pointers are exclusively owned by this struct; the only
// other party touching the shared memory is the kernel, which the ring
// index protocol already accounts for.
unsafe impl Send for Socket {}

impl Socket {
    /// Opens and binds an AF_XDP socket on `if_index`/`queue_id`.
    pub fn new(if_index: u32, queue_id: u32, config: XskConfig) -> io::Result<Socket> {
        let (fd, raw_fd) = unsafe {
            let fd = libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            (OwnedFd::from_raw_fd(fd), fd)
        };

        let umem = setup_umem(raw_fd, &config)?;
        log::debug!(
            "UMEM registered: {} frames of {} bytes",
            FRAME_COUNT,
            FRAME_SIZE
        );

        RingType::Fill.set_size(raw_fd, DEFAULT_RING_SIZE)?;
        RingType::Completion.set_size(raw_fd, DEFAULT_RING_SIZE)?;
        RingType::Rx.set_size(raw_fd, DEFAULT_RING_SIZE)?;
        RingType::Tx.set_size(raw_fd, DEFAULT_RING_SIZE)?;

        let offsets = ring_offsets(raw_fd)?;
        let rx = ConsumerRing::new(RingType::Rx.mmap(raw_fd, &offsets, DEFAULT_RING_SIZE)?);
        let tx = ProducerRing::new(RingType::Tx.mmap(raw_fd, &offsets, DEFAULT_RING_SIZE)?);
        let fill = ProducerRing::new(RingType::Fill.mmap(raw_fd, &offsets, DEFAULT_RING_SIZE)?);
        let completion =
            ConsumerRing::new(RingType::Completion.mmap(raw_fd, &offsets, DEFAULT_RING_SIZE)?);

        let zero_copy = match config.zero_copy {
            Some(true) => libc::XDP_ZEROCOPY,
            Some(false) => libc::XDP_COPY,
            None => 0,
        };
        let need_wakeup = config.need_wakeup.unwrap_or(true);
        let wakeup_flag = if need_wakeup {
            libc::XDP_USE_NEED_WAKEUP
        } else {
            0
        };

        let sxdp = libc::sockaddr_xdp {
            sxdp_family: libc::AF_XDP as libc::sa_family_t,
            sxdp_flags: wakeup_flag | zero_copy,
            sxdp_ifindex: if_index,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };

        if unsafe {
            libc::bind(
                raw_fd,
                &sxdp as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_xdp>() as libc::socklen_t,
            ) < 0
        } {
            return Err(io::Error::other(format!(
                "Failed to bind: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Socket {
            rx,
            tx,
            fill,
            completion,
            umem,
            fd,
            need_wakeup,
        })
    }

    pub fn raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    /// Whether the socket was bound with `XDP_USE_NEED_WAKEUP`. Without it,
    /// every submitted transmission needs an explicit kick.
    pub fn bound_with_need_wakeup(&self) -> bool {
        self.need_wakeup
    }

    pub fn arena_ptr(&self) -> *mut u8 {
        self.umem.as_u8_ptr()
    }

    pub fn arena_len(&self) -> usize {
        self.umem.len()
    }

    /// Kicks the kernel with a zero-length send so it processes the TX ring.
    ///
    /// Skipped when the kernel did not flag `XDP_RING_NEED_WAKEUP`, unless
    /// `enforce` is set. `EBUSY`/`ENOBUFS`/`EAGAIN` mean the kernel is
    /// already busy and are not errors.
    pub fn wakeup(&self, enforce: bool) -> io::Result<()> {
        let need_wakeup =
            enforce || self.tx.ring.flags() & libc::XDP_RING_NEED_WAKEUP != 0;
        if need_wakeup
            && 0 > unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    ptr::null(),
                    0,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                    ptr::null(),
                    0,
                )
            }
        {
            match io::Error::last_os_error().raw_os_error() {
                None | Some(libc::EBUSY | libc::ENOBUFS | libc::EAGAIN) => {}
                Some(libc::ENETDOWN) => {
                    log::warn!("network interface is down, cannot wake up");
                }
                Some(e) => {
                    return Err(io::Error::from_raw_os_error(e));
                }
            }
        }
        Ok(())
    }

    /// Blocks until the socket is readable or the timeout elapses.
    ///
    /// Returns `Ok(false)` on timeout, zero readiness or `EINTR`; all three
    /// mean "no work this iteration".
    pub fn poll_wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let millis = timeout.map_or(-1, |t| t.as_millis().min(i32::MAX as u128) as libc::c_int);
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ret > 0 && fds[0].revents & libc::POLLIN != 0)
    }
}

/// Queries the kernel for the mmap offsets of all four rings.
pub fn ring_offsets(raw_fd: libc::c_int) -> io::Result<libc::xdp_mmap_offsets> {
    let mut offsets: libc::xdp_mmap_offsets = unsafe { std::mem::zeroed() };
    let mut optlen = size_of::<libc::xdp_mmap_offsets>() as libc::socklen_t;
    unsafe {
        if libc::getsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(offsets)
}

/// Allocates the arena and registers it as UMEM with `FRAME_SIZE` chunks.
fn setup_umem(raw_fd: libc::c_int, config: &XskConfig) -> io::Result<OwnedMmap> {
    let umem = OwnedMmap::mmap(FRAME_COUNT * FRAME_SIZE, config.huge_page)
        .map_err(|e| io::Error::other(format!("Failed to allocate UMEM: {}", e)))?;

    let reg = unsafe {
        libc::xdp_umem_reg {
            addr: umem.as_void_ptr() as u64,
            len: umem.len() as u64,
            chunk_size: FRAME_SIZE as u32,
            ..std::mem::zeroed()
        }
    };

    unsafe {
        if libc::setsockopt(
            raw_fd,
            libc::SOL_XDP,
            libc::XDP_UMEM_REG,
            &reg as *const _ as *const libc::c_void,
            size_of::<libc::xdp_umem_reg>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::other(format!(
                "Failed to register UMEM: {}",
                io::Error::last_os_error()
            )));
        }
    }

    Ok(umem)
}
