//! The live disk tap: a local socket fed with (sector, count) write
//! notifications from a monitored guest, a bounded FIFO between the socket
//! thread and the worker, and the worker itself, which re-reads the named
//! sectors and extracts any fresh file content it finds there before the
//! guest can overwrite it.

use crate::device::BlockDevice;
use crate::error::NtfsError;
use crate::extract::Extractor;
use crate::harvest::Volume;
use crate::layout::{self, RECORD_SIZE, SECTOR_SIZE};
use crate::record;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Abstract-namespace socket name the producer listens on.
pub const TAP_SOCKET_NAME: &str = "diskTap";

/// Ring slots. One is always left empty, so 1000 events can be queued.
pub const Q_SIZE: usize = 1001;

/// Wire size of one tap notification.
pub const TAP_FRAME_SIZE: usize = 16;

/// Largest write, in sectors, worth scanning for MFT records.
pub const MAX_TAP_SECTORS: i32 = 32;

/// How long the worker sleeps once the queue runs dry.
const DRAIN_SLEEP: Duration = Duration::from_secs(10);

/// Slice of the drain sleep between cancellation checks.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// One write notification: the guest wrote `n_sectors` sectors starting at
/// absolute sector `sector` on the monitored device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapEvent {
    pub sector: i64,
    pub n_sectors: i32,
}

impl TapEvent {
    /// Decodes a frame: i64 sector, i32 count, 4 bytes padding, all in
    /// host byte order (producer and consumer share the ABI).
    pub fn from_frame(frame: &[u8; TAP_FRAME_SIZE]) -> Self {
        let mut sector = [0u8; 8];
        sector.copy_from_slice(&frame[..8]);
        let mut count = [0u8; 4];
        count.copy_from_slice(&frame[8..12]);
        Self {
            sector: i64::from_ne_bytes(sector),
            n_sectors: i32::from_ne_bytes(count),
        }
    }

    pub fn to_frame(&self) -> [u8; TAP_FRAME_SIZE] {
        let mut frame = [0u8; TAP_FRAME_SIZE];
        frame[..8].copy_from_slice(&self.sector.to_ne_bytes());
        frame[8..12].copy_from_slice(&self.n_sectors.to_ne_bytes());
        frame
    }

    /// A write can hold MFT records only if it spans 1 to 16 whole
    /// 1024-byte records: an even sector count between 2 and 32.
    pub fn is_plausible_mft_write(&self) -> bool {
        self.sector >= 0
            && self.n_sectors > 0
            && self.n_sectors <= MAX_TAP_SECTORS
            && self.n_sectors % 2 == 0
    }
}

struct Ring {
    slots: Vec<TapEvent>,
    put_index: usize,
    get_index: usize,
}

/// Bounded FIFO between the socket thread and the worker.
///
/// Strictly ordered, one mutex around the indices. `put` reports failure
/// when the ring is full; the producer drops the event, which is
/// acceptable for an opportunistic tap.
pub struct TapQueue {
    ring: Mutex<Ring>,
}

impl TapQueue {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: vec![TapEvent { sector: 0, n_sectors: 0 }; Q_SIZE],
                put_index: 0,
                get_index: 0,
            }),
        }
    }

    /// Enqueues one event. Returns false when the queue is full.
    pub fn put(&self, event: TapEvent) -> bool {
        let mut ring = self.ring.lock();
        if (ring.put_index + 1) % Q_SIZE == ring.get_index {
            return false;
        }
        let index = ring.put_index;
        ring.slots[index] = event;
        ring.put_index = (index + 1) % Q_SIZE;
        true
    }

    /// Dequeues the oldest event, if any.
    pub fn get(&self) -> Option<TapEvent> {
        let mut ring = self.ring.lock();
        if ring.put_index == ring.get_index {
            return None;
        }
        let event = ring.slots[ring.get_index];
        ring.get_index = (ring.get_index + 1) % Q_SIZE;
        Some(event)
    }

    pub fn len(&self) -> usize {
        let ring = self.ring.lock();
        (ring.put_index + Q_SIZE - ring.get_index) % Q_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TapQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<std::os::unix::net::UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    std::os::unix::net::UnixListener::bind_addr(&addr)
}

#[cfg(target_os = "linux")]
pub fn connect_abstract(name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    std::os::unix::net::UnixStream::connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<std::os::unix::net::UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn connect_abstract(_name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}

/// The producer: accepts one client at a time on the abstract socket and
/// enqueues every frame it reads. Runs for the life of the process.
pub struct TapServer {
    queue: Arc<TapQueue>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    socket_name: String,
}

impl TapServer {
    pub fn start(socket_name: &str, queue: Arc<TapQueue>) -> io::Result<Self> {
        let listener = bind_abstract(socket_name)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_queue = Arc::clone(&queue);
        let accept_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if accept_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        serve_connection(stream, &accept_queue);
                    }
                    Err(e) => {
                        if accept_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "tap socket accept failed");
                    }
                }
            }
        });

        info!(socket = socket_name, "disk tap socket listening");
        Ok(Self {
            queue,
            shutdown,
            handle: Some(handle),
            socket_name: socket_name.to_string(),
        })
    }

    pub fn queue(&self) -> Arc<TapQueue> {
        Arc::clone(&self.queue)
    }

    /// Stops the accept loop and joins the thread. A throwaway connection
    /// wakes the blocking accept so the shutdown flag is seen.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = connect_abstract(&self.socket_name);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connection(mut stream: std::os::unix::net::UnixStream, queue: &TapQueue) {
    let mut frame = [0u8; TAP_FRAME_SIZE];
    loop {
        match stream.read_exact(&mut frame) {
            Ok(()) => {
                let event = TapEvent::from_frame(&frame);
                debug!(sector = event.sector, n_sectors = event.n_sectors, "tap event");
                if !queue.put(event) {
                    warn!(sector = event.sector, "tap queue full, dropping event");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("tap client disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "tap socket read failed");
                break;
            }
        }
    }
}

/// Recency filter: a modification counts as recent when it happened no
/// more than `max_age` ago, both times in NTFS 100-ns intervals.
pub fn is_recent(modified: u64, now: u64, max_age: u64) -> bool {
    now.saturating_sub(modified) <= max_age
}

/// Everything the worker needs, captured at spawn time.
pub struct TapWorkerContext {
    pub device: Arc<Mutex<BlockDevice>>,
    pub volumes: Vec<Volume>,
    pub extractor: Arc<Extractor>,
    pub max_age_ticks: u64,
}

/// Handles one notification: re-reads the written sectors and extracts
/// every in-use, recently-modified, named record found in them. Returns
/// how many files were written.
pub fn handle_event(
    ctx: &TapWorkerContext,
    event: TapEvent,
    cancel: &AtomicBool,
) -> Result<u32, NtfsError> {
    let byte_offset = event.sector as u64 * SECTOR_SIZE;
    let length = event.n_sectors as u64 * SECTOR_SIZE;

    let Some(volume) = ctx.volumes.iter().find(|v| v.contains_byte(byte_offset)) else {
        debug!(sector = event.sector, "write outside any NTFS volume");
        return Ok(0);
    };

    let buf = {
        let mut device = ctx.device.lock();
        if byte_offset + length > device.size() {
            debug!(sector = event.sector, "write extends past end of device");
            return Ok(0);
        }
        device.read_vec_at(byte_offset, length as usize)?
    };

    let now = layout::ntfs_time_now();
    let mut written = 0u32;

    for window in buf.chunks_exact(RECORD_SIZE) {
        if !layout::has_file_signature(window) {
            continue;
        }
        let decoded = match record::decode_record(window) {
            Ok(decoded) => decoded,
            Err(_) => continue,
        };
        if !decoded.is_in_use() {
            continue;
        }

        let recent = decoded
            .std_info
            .as_ref()
            .is_some_and(|si| is_recent(si.modified, now, ctx.max_age_ticks));
        if !recent {
            debug!(
                record = decoded.header.record_number,
                "modification too old, skipping"
            );
            continue;
        }

        match ctx.extractor.extract_record_data(&decoded, volume, Some(cancel)) {
            Ok(outcome) => {
                info!(record = decoded.header.record_number, "{outcome}");
                if outcome.was_written() {
                    written += 1;
                }
            }
            Err(e) => warn!(
                record = decoded.header.record_number,
                error = %e,
                "tap extraction failed"
            ),
        }
    }

    Ok(written)
}

/// The consumer worker. Spawned on "start server", cancelled and joined on
/// "stop server".
pub struct TapConsumer {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TapConsumer {
    pub fn spawn(queue: Arc<TapQueue>, ctx: TapWorkerContext) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);

        let handle = thread::spawn(move || {
            worker_loop(&queue, &ctx, &worker_cancel);
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: &TapQueue, ctx: &TapWorkerContext, cancel: &AtomicBool) {
    info!("tap consumer running");
    'outer: loop {
        while let Some(event) = queue.get() {
            if cancel.load(Ordering::SeqCst) {
                break 'outer;
            }
            if !event.is_plausible_mft_write() {
                debug!(
                    sector = event.sector,
                    n_sectors = event.n_sectors,
                    "ignoring implausible write"
                );
                continue;
            }
            if let Err(e) = handle_event(ctx, event, cancel) {
                warn!(sector = event.sector, error = %e, "tap event aborted");
            }
        }

        // Queue drained; doze, waking early if cancelled.
        let mut slept = Duration::ZERO;
        while slept < DRAIN_SLEEP {
            if cancel.load(Ordering::SeqCst) {
                break 'outer;
            }
            thread::sleep(SLEEP_SLICE);
            slept += SLEEP_SLICE;
        }
    }
    info!("tap consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let queue = TapQueue::new();
        for i in 0..5 {
            assert!(queue.put(TapEvent { sector: i, n_sectors: 2 }));
        }
        for i in 0..5 {
            assert_eq!(queue.get().unwrap().sector, i);
        }
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn queue_rejects_when_full() {
        let queue = TapQueue::new();
        for i in 0..(Q_SIZE - 1) as i64 {
            assert!(queue.put(TapEvent { sector: i, n_sectors: 2 }));
        }
        // 1000 queued, one slot kept empty.
        assert_eq!(queue.len(), Q_SIZE - 1);
        assert!(!queue.put(TapEvent { sector: 9999, n_sectors: 2 }));

        // Draining one slot makes room again.
        assert_eq!(queue.get().unwrap().sector, 0);
        assert!(queue.put(TapEvent { sector: 9999, n_sectors: 2 }));
    }

    #[test]
    fn queue_wraps_around() {
        let queue = TapQueue::new();
        for round in 0..3 {
            for i in 0..Q_SIZE as i64 - 1 {
                assert!(queue.put(TapEvent { sector: round * 10_000 + i, n_sectors: 2 }));
            }
            for i in 0..Q_SIZE as i64 - 1 {
                assert_eq!(queue.get().unwrap().sector, round * 10_000 + i);
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn frame_round_trip() {
        let event = TapEvent {
            sector: 0x1122_3344_5566,
            n_sectors: 8,
        };
        let frame = event.to_frame();
        assert_eq!(TapEvent::from_frame(&frame), event);
        // Trailing padding stays zero.
        assert_eq!(&frame[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn plausibility_filter() {
        let ok = |n| TapEvent { sector: 100, n_sectors: n }.is_plausible_mft_write();
        assert!(!ok(0));
        assert!(!ok(1));
        assert!(!ok(7));
        assert!(!ok(34));
        assert!(!ok(-2));
        assert!(ok(2));
        assert!(ok(8));
        assert!(ok(32));
        assert!(!TapEvent { sector: -1, n_sectors: 8 }.is_plausible_mft_write());
    }

    #[test]
    fn recency_boundaries() {
        let now = layout::unix_to_ntfs_time(1_000_000);
        let max_age = 300 * layout::NTFS_TICKS_PER_SECOND;
        assert!(is_recent(now, now, max_age));
        assert!(is_recent(now - max_age, now, max_age));
        assert!(!is_recent(now - max_age - 1, now, max_age));
        // A timestamp from the future still counts as recent.
        assert!(is_recent(now + 1, now, max_age));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn socket_feeds_queue() {
        use std::io::Write;
        use std::time::Instant;

        let socket_name = format!("mftap-test-{}", std::process::id());
        let queue = Arc::new(TapQueue::new());
        let server = TapServer::start(&socket_name, Arc::clone(&queue)).unwrap();

        let mut client = connect_abstract(&socket_name).unwrap();
        for i in 0..3 {
            let event = TapEvent { sector: 2048 + i, n_sectors: 8 };
            client.write_all(&event.to_frame()).unwrap();
        }
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get().unwrap().sector, 2048);

        server.shutdown();
    }
}
