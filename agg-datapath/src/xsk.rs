//! AF_XDP socket plumbing.
//!
//! One UMEM arena, four rings. Userspace produces into the fill and
//! transmit rings and consumes from the receive and completion rings; the
//! kernel does the opposite. Instead of one syscall per packet, descriptors
//! are batched through shared memory and the kernel is kicked with an empty
//! `sendto` when it needs waking.
//!
//! ```text
//! USERSPACE                           KERNEL
//! ─────────────────────────────────────────────────────────
//!                   UMEM (shared mmap'd memory)
//!            ┌────────────────────────────────────┐
//!            │ frame0 │ frame1 │ frame2 │ frame3 │
//!            └────────────────────────────────────┘
//!   fill ring ───▶ kernel fills frames with rx packets ───▶ rx ring
//!   tx ring   ───▶ kernel transmits frames            ───▶ completion ring
//! ```

use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use anyhow::{anyhow, ensure, Result};
use tracing::{debug, info};

use crate::{DeliverStatus, FinalizedSink, FrameHandler, StatsRecord, Verdict};

// XDP socket constants (from linux/if_xdp.h); not exposed by libc.

// Bind flags
const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

// Socket options (for setsockopt/getsockopt)
const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

// Socket level for XDP
const SOL_XDP: libc::c_int = 283;

// Mmap page offsets selecting which ring a mapping refers to
const XDP_PGOFF_RX_RING: libc::off_t = 0;
const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

/// Receive descriptors taken per poll.
const RX_BATCH: u32 = 64;

#[repr(C)]
#[derive(Debug, Default)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

/// RX/TX descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

/// Configuration for one AF_XDP socket.
pub struct XskConfig {
    /// Interface name
    pub interface: String,
    /// Queue ID (usually 0)
    pub queue_id: u32,
    /// Number of frames in UMEM
    pub num_frames: u32,
    /// Size of each frame
    pub frame_size: u32,
    /// Ring sizes (powers of 2)
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
    pub fill_ring_size: u32,
    pub comp_ring_size: u32,
    /// Use zero-copy mode (requires driver support)
    pub zero_copy: bool,
    /// Use the need_wakeup flag (reduces syscalls)
    pub need_wakeup: bool,
}

impl Default for XskConfig {
    fn default() -> Self {
        Self {
            interface: "ens3".to_string(),
            queue_id: 0,
            num_frames: 4096,
            frame_size: 2048,
            rx_ring_size: 2048,
            tx_ring_size: 2048,
            fill_ring_size: 2048,
            comp_ring_size: 2048,
            zero_copy: false, // copy mode works everywhere
            need_wakeup: true,
        }
    }
}

/// Fixed-capacity LIFO free list over the UMEM frame offsets. A frame is
/// either here or owned by exactly one in-flight descriptor, never both.
pub struct UmemPool {
    free: Vec<u64>,
    num_frames: u32,
    frame_size: u32,
}

impl UmemPool {
    pub fn new(num_frames: u32, frame_size: u32) -> Self {
        let free = (0..num_frames).map(|i| (i as u64) * frame_size as u64).collect();
        Self {
            free,
            num_frames,
            frame_size,
        }
    }

    /// Take a frame offset, or `None` when the arena is exhausted.
    pub fn alloc(&mut self) -> Option<u64> {
        self.free.pop()
    }

    /// Return a frame offset. Double release is a programming error.
    pub fn release(&mut self, addr: u64) {
        debug_assert!(
            addr % self.frame_size as u64 == 0,
            "release of unaligned frame offset {addr:#x}"
        );
        debug_assert!(
            addr < self.num_frames as u64 * self.frame_size as u64,
            "release of out-of-arena frame offset {addr:#x}"
        );
        debug_assert!(
            !self.free.contains(&addr),
            "double release of frame {addr:#x}"
        );
        self.free.push(addr);
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }
}

/// Userspace producer side of a descriptor ring (transmit).
struct TxRing {
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    ring: *mut XdpDesc,
    mask: u32,
    size: u32,
}

unsafe impl Send for TxRing {}

impl TxRing {
    fn free_slots(&self) -> u32 {
        let cons = unsafe { (*self.consumer).load(Ordering::Acquire) };
        let prod = unsafe { (*self.producer).load(Ordering::Relaxed) };
        self.size - prod.wrapping_sub(cons)
    }

    /// Write one descriptor and make it visible to the kernel.
    fn produce(&self, addr: u64, len: u32) -> bool {
        if self.free_slots() == 0 {
            return false;
        }
        let prod = unsafe { (*self.producer).load(Ordering::Relaxed) };
        let slot = (prod & self.mask) as usize;
        unsafe {
            let desc = self.ring.add(slot);
            (*desc).addr = addr;
            (*desc).len = len;
            (*desc).options = 0;
        }
        fence(Ordering::Release);
        unsafe { (*self.producer).store(prod.wrapping_add(1), Ordering::Release) };
        true
    }
}

/// Userspace consumer side of a descriptor ring (receive).
struct RxRing {
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    ring: *mut XdpDesc,
    mask: u32,
}

unsafe impl Send for RxRing {}

impl RxRing {
    fn available(&self, max: u32) -> u32 {
        let prod = unsafe { (*self.producer).load(Ordering::Acquire) };
        let cons = unsafe { (*self.consumer).load(Ordering::Relaxed) };
        prod.wrapping_sub(cons).min(max)
    }

    fn consumer_pos(&self) -> u32 {
        unsafe { (*self.consumer).load(Ordering::Relaxed) }
    }

    fn desc(&self, idx: u32) -> XdpDesc {
        unsafe { *self.ring.add((idx & self.mask) as usize) }
    }

    fn release(&self, count: u32) {
        let cons = unsafe { (*self.consumer).load(Ordering::Relaxed) };
        unsafe { (*self.consumer).store(cons.wrapping_add(count), Ordering::Release) };
    }
}

/// Userspace producer side of an address ring (fill).
struct FillRing {
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    ring: *mut u64,
    mask: u32,
    size: u32,
}

unsafe impl Send for FillRing {}

impl FillRing {
    fn free_slots(&self) -> u32 {
        let cons = unsafe { (*self.consumer).load(Ordering::Acquire) };
        let prod = unsafe { (*self.producer).load(Ordering::Relaxed) };
        self.size - prod.wrapping_sub(cons)
    }

    fn producer_pos(&self) -> u32 {
        unsafe { (*self.producer).load(Ordering::Relaxed) }
    }

    fn write_addr(&self, idx: u32, addr: u64) {
        unsafe { *self.ring.add((idx & self.mask) as usize) = addr };
    }

    fn submit(&self, count: u32) {
        fence(Ordering::Release);
        let prod = unsafe { (*self.producer).load(Ordering::Relaxed) };
        unsafe { (*self.producer).store(prod.wrapping_add(count), Ordering::Release) };
    }
}

/// Userspace consumer side of an address ring (completion).
struct CompRing {
    producer: *mut AtomicU32,
    consumer: *mut AtomicU32,
    ring: *mut u64,
    mask: u32,
}

unsafe impl Send for CompRing {}

impl CompRing {
    fn available(&self, max: u32) -> u32 {
        let prod = unsafe { (*self.producer).load(Ordering::Acquire) };
        let cons = unsafe { (*self.consumer).load(Ordering::Relaxed) };
        prod.wrapping_sub(cons).min(max)
    }

    fn consumer_pos(&self) -> u32 {
        unsafe { (*self.consumer).load(Ordering::Relaxed) }
    }

    fn addr(&self, idx: u32) -> u64 {
        unsafe { *self.ring.add((idx & self.mask) as usize) }
    }

    fn release(&self, count: u32) {
        let cons = unsafe { (*self.consumer).load(Ordering::Relaxed) };
        unsafe { (*self.consumer).store(cons.wrapping_add(count), Ordering::Release) };
    }
}

/// One AF_XDP socket: UMEM, rings, frame pool and counters.
pub struct XskSocket {
    fd: libc::c_int,
    umem: *mut u8,
    umem_size: usize,
    frame_size: u32,
    rx: RxRing,
    tx: TxRing,
    fill: FillRing,
    comp: CompRing,
    ring_maps: [(*mut u8, usize); 4],
    pool: UmemPool,
    outstanding_tx: u32,

    // Stats
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub kicks: AtomicU64,
}

unsafe impl Send for XskSocket {}

impl XskSocket {
    /// Create and bind a socket per `config`, prime the fill ring, and
    /// return it ready for `poll`.
    pub fn bind(config: &XskConfig) -> Result<Self> {
        for size in [
            config.rx_ring_size,
            config.tx_ring_size,
            config.fill_ring_size,
            config.comp_ring_size,
        ] {
            ensure!(size.is_power_of_two(), "ring sizes must be powers of two");
        }

        info!(
            "creating AF_XDP socket on {} queue {}",
            config.interface, config.queue_id
        );

        let ifname = std::ffi::CString::new(config.interface.as_str())?;
        let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if ifindex == 0 {
            return Err(anyhow!("interface {} not found", config.interface));
        }

        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(anyhow!(
                "failed to create XDP socket: {}. Need root/CAP_NET_RAW",
                std::io::Error::last_os_error()
            ));
        }
        debug!("created XDP socket fd={}", fd);

        let umem_size = (config.num_frames as usize) * (config.frame_size as usize);

        // Hugepages when available, regular pages otherwise.
        let mut umem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                umem_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if umem == libc::MAP_FAILED {
            debug!("hugepages unavailable, using regular pages");
            umem = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    umem_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
        }
        if umem == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(anyhow!("failed to mmap UMEM: {}", err));
        }
        info!(
            "allocated UMEM: {} frames x {} bytes = {} MB",
            config.num_frames,
            config.frame_size,
            umem_size / 1024 / 1024
        );

        let fail = |msg: &str| -> anyhow::Error {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(umem, umem_size);
                libc::close(fd);
            }
            anyhow!("{}: {}", msg, err)
        };

        // Register the UMEM and size all four rings.
        let umem_reg = XdpUmemReg {
            addr: umem as u64,
            len: umem_size as u64,
            chunk_size: config.frame_size,
            headroom: 0,
            flags: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                SOL_XDP,
                XDP_UMEM_REG,
                &umem_reg as *const _ as *const libc::c_void,
                std::mem::size_of::<XdpUmemReg>() as u32,
            )
        };
        if ret < 0 {
            return Err(fail("failed to register UMEM"));
        }

        for (opt, size, what) in [
            (XDP_RX_RING, config.rx_ring_size, "RX ring"),
            (XDP_TX_RING, config.tx_ring_size, "TX ring"),
            (XDP_UMEM_FILL_RING, config.fill_ring_size, "fill ring"),
            (XDP_UMEM_COMPLETION_RING, config.comp_ring_size, "completion ring"),
        ] {
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    SOL_XDP,
                    opt,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<u32>() as u32,
                )
            };
            if ret < 0 {
                return Err(fail(&format!("failed to size {}", what)));
            }
        }

        let mut offsets = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as u32;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(fail("failed to get mmap offsets"));
        }

        let desc_bytes = std::mem::size_of::<XdpDesc>();
        let rx_map_size = offsets.rx.desc as usize + config.rx_ring_size as usize * desc_bytes;
        let tx_map_size = offsets.tx.desc as usize + config.tx_ring_size as usize * desc_bytes;
        let fr_map_size = offsets.fr.desc as usize + config.fill_ring_size as usize * 8;
        let cr_map_size = offsets.cr.desc as usize + config.comp_ring_size as usize * 8;

        let map_ring = |size: usize, pgoff: libc::off_t, what: &str| -> Result<*mut u8> {
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_POPULATE,
                    fd,
                    pgoff,
                )
            };
            if ptr == libc::MAP_FAILED {
                Err(fail(&format!("failed to mmap {}", what)))
            } else {
                Ok(ptr as *mut u8)
            }
        };

        let rx_map = map_ring(rx_map_size, XDP_PGOFF_RX_RING, "RX ring")?;
        let tx_map = map_ring(tx_map_size, XDP_PGOFF_TX_RING, "TX ring")?;
        let fr_map = map_ring(fr_map_size, XDP_UMEM_PGOFF_FILL_RING, "fill ring")?;
        let cr_map = map_ring(cr_map_size, XDP_UMEM_PGOFF_COMPLETION_RING, "completion ring")?;

        let rx = RxRing {
            producer: unsafe { rx_map.add(offsets.rx.producer as usize) as *mut AtomicU32 },
            consumer: unsafe { rx_map.add(offsets.rx.consumer as usize) as *mut AtomicU32 },
            ring: unsafe { rx_map.add(offsets.rx.desc as usize) as *mut XdpDesc },
            mask: config.rx_ring_size - 1,
        };
        let tx = TxRing {
            producer: unsafe { tx_map.add(offsets.tx.producer as usize) as *mut AtomicU32 },
            consumer: unsafe { tx_map.add(offsets.tx.consumer as usize) as *mut AtomicU32 },
            ring: unsafe { tx_map.add(offsets.tx.desc as usize) as *mut XdpDesc },
            mask: config.tx_ring_size - 1,
            size: config.tx_ring_size,
        };
        let fill = FillRing {
            producer: unsafe { fr_map.add(offsets.fr.producer as usize) as *mut AtomicU32 },
            consumer: unsafe { fr_map.add(offsets.fr.consumer as usize) as *mut AtomicU32 },
            ring: unsafe { fr_map.add(offsets.fr.desc as usize) as *mut u64 },
            mask: config.fill_ring_size - 1,
            size: config.fill_ring_size,
        };
        let comp = CompRing {
            producer: unsafe { cr_map.add(offsets.cr.producer as usize) as *mut AtomicU32 },
            consumer: unsafe { cr_map.add(offsets.cr.consumer as usize) as *mut AtomicU32 },
            ring: unsafe { cr_map.add(offsets.cr.desc as usize) as *mut u64 },
            mask: config.comp_ring_size - 1,
        };

        // Bind to the interface queue.
        #[repr(C)]
        struct SockaddrXdp {
            sxdp_family: u16,
            sxdp_flags: u16,
            sxdp_ifindex: u32,
            sxdp_queue_id: u32,
            sxdp_shared_umem_fd: u32,
        }

        let mut bind_flags = 0u16;
        if config.zero_copy {
            bind_flags |= XDP_ZEROCOPY;
        } else {
            bind_flags |= XDP_COPY;
        }
        if config.need_wakeup {
            bind_flags |= XDP_USE_NEED_WAKEUP;
        }

        let sxdp = SockaddrXdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: bind_flags,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: config.queue_id,
            sxdp_shared_umem_fd: 0,
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrXdp>() as u32,
            )
        };
        if ret < 0 {
            return Err(fail(&format!(
                "failed to bind XDP socket to {}:{}",
                config.interface, config.queue_id
            )));
        }
        info!(
            "bound to {}:{} with flags 0x{:x}",
            config.interface, config.queue_id, bind_flags
        );

        let mut socket = Self {
            fd,
            umem: umem as *mut u8,
            umem_size,
            frame_size: config.frame_size,
            rx,
            tx,
            fill,
            comp,
            ring_maps: [
                (rx_map, rx_map_size),
                (tx_map, tx_map_size),
                (fr_map, fr_map_size),
                (cr_map, cr_map_size),
            ],
            pool: UmemPool::new(config.num_frames, config.frame_size),
            outstanding_tx: 0,
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
        };

        // Give the kernel a full fill ring before the first packet.
        socket.refill();
        info!("fill ring primed, {} frames free", socket.pool.free_frames());

        Ok(socket)
    }

    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    pub fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    /// One pass over the receive path: refill, process up to a batch of
    /// frames through `handler`, then reclaim completed transmissions.
    /// Returns the number of frames handled.
    pub fn poll<H: FrameHandler>(&mut self, handler: &mut H) -> Result<usize> {
        let rcvd = self.rx.available(RX_BATCH);
        if rcvd == 0 {
            self.complete_tx()?;
            return Ok(0);
        }

        // Keep the kernel's producer side supplied before touching payloads.
        self.refill();

        let cons = self.rx.consumer_pos();
        for i in 0..rcvd {
            let desc = self.rx.desc(cons.wrapping_add(i));
            let len = (desc.len as usize).min(self.frame_size as usize);
            let frame =
                unsafe { std::slice::from_raw_parts_mut(self.umem.add(desc.addr as usize), len) };

            self.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.rx_bytes.fetch_add(desc.len as u64, Ordering::Relaxed);

            match handler.handle(frame) {
                Verdict::Transmit(tx_len) => {
                    if self.tx.produce(desc.addr, tx_len) {
                        self.outstanding_tx += 1;
                        self.tx_packets.fetch_add(1, Ordering::Relaxed);
                        self.tx_bytes.fetch_add(tx_len as u64, Ordering::Relaxed);
                    } else {
                        self.pool.release(desc.addr);
                    }
                }
                Verdict::Release => self.pool.release(desc.addr),
            }
        }
        self.rx.release(rcvd);

        self.complete_tx()?;
        Ok(rcvd as usize)
    }

    /// Move free frames into the fill ring, bounded by both the pool and
    /// the ring headroom.
    fn refill(&mut self) {
        let stock = (self.pool.free_frames() as u32).min(self.fill.free_slots());
        if stock == 0 {
            return;
        }
        let prod = self.fill.producer_pos();
        let mut pushed = 0;
        while pushed < stock {
            match self.pool.alloc() {
                Some(addr) => {
                    self.fill.write_addr(prod.wrapping_add(pushed), addr);
                    pushed += 1;
                }
                None => break,
            }
        }
        self.fill.submit(pushed);
    }

    /// Kick the kernel and reclaim completed transmit frames. Non-blocking;
    /// the outstanding counter never underflows.
    fn complete_tx(&mut self) -> Result<()> {
        if self.outstanding_tx == 0 {
            return Ok(());
        }
        self.kick()?;

        let completed = self.comp.available(u32::MAX);
        if completed == 0 {
            return Ok(());
        }
        let cons = self.comp.consumer_pos();
        for i in 0..completed {
            self.pool.release(self.comp.addr(cons.wrapping_add(i)));
        }
        self.comp.release(completed);
        self.outstanding_tx -= completed.min(self.outstanding_tx);
        Ok(())
    }

    /// Wake the kernel's transmit side.
    pub fn kick(&self) -> Result<()> {
        let ret = unsafe {
            libc::sendto(
                self.fd,
                ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null(),
                0,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN)
                && err.raw_os_error() != Some(libc::EBUSY)
            {
                return Err(anyhow!("sendto failed: {}", err));
            }
        }
        self.kicks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Counters at this instant, for the reporting task.
    pub fn snapshot(&self) -> StatsRecord {
        StatsRecord {
            timestamp: std::time::Instant::now(),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

impl FinalizedSink for XskSocket {
    fn deliver(&mut self, frame: &[u8]) -> DeliverStatus {
        if frame.len() > self.frame_size as usize {
            return DeliverStatus::Backpressure;
        }
        let Some(addr) = self.pool.alloc() else {
            return DeliverStatus::Backpressure;
        };
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), self.umem.add(addr as usize), frame.len());
        }
        if !self.tx.produce(addr, frame.len() as u32) {
            self.pool.release(addr);
            return DeliverStatus::Backpressure;
        }
        self.outstanding_tx += 1;
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        let _ = self.kick();
        DeliverStatus::Accepted
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        unsafe {
            for (ptr, size) in self.ring_maps {
                libc::munmap(ptr as *mut libc::c_void, size);
            }
            libc::munmap(self.umem as *mut libc::c_void, self.umem_size);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_never_double_issues() {
        let mut pool = UmemPool::new(8, 2048);
        let mut issued = Vec::new();
        while let Some(addr) = pool.alloc() {
            assert!(!issued.contains(&addr), "frame {addr:#x} issued twice");
            assert_eq!(addr % 2048, 0);
            issued.push(addr);
        }
        assert_eq!(issued.len(), 8);
        assert_eq!(pool.free_frames(), 0);

        // Exhausted until something comes back.
        assert_eq!(pool.alloc(), None);
        pool.release(issued.pop().unwrap());
        assert_eq!(pool.free_frames(), 1);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_pool_release_makes_frame_reusable() {
        let mut pool = UmemPool::new(2, 2048);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        // LIFO: the frame released last is issued next.
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_pool_double_release_is_fatal() {
        let mut pool = UmemPool::new(4, 2048);
        let addr = pool.alloc().unwrap();
        pool.release(addr);
        pool.release(addr);
    }

    #[test]
    #[should_panic(expected = "out-of-arena")]
    fn test_pool_rejects_foreign_offset() {
        let mut pool = UmemPool::new(4, 2048);
        pool.release(4 * 2048);
    }
}
