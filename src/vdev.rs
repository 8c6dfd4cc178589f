//! Per-interface capture state and the producer entry points
//!
//! Producers call one of the submission methods from whatever context they
//! run in. A submission never blocks and never fails: frames that cannot be
//! captured are dropped and counted, and the reason is returned as a
//! `SubmitOutcome`.

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use radio802::frame::{DsDirection, EthernetHeader, Ieee80211Header, MacAddr, MacDisplay};
use radio802::{FrameFormat, RxStatus, TxStatus};

use crate::classify::{classify, Category, Direction, MacroCategory};
use crate::config::CaptureConfig;
use crate::filter::{beacon_sampling_period, should_capture, BeaconSampler, FilterUpdate, FrameFilter};
use crate::header::{MetadataHeaderBuilder, PhyStatus};
use crate::mode::{CaptureMode, ModeController, ModeState};
use crate::pool::{Wrapper, WrapperPool};
use crate::queue::{CaptureQueue, PushError};
use crate::stats::{CaptureStats, StatsSnapshot};
use crate::worker::{Worker, WorkerState, WorkerTimeouts};
use crate::{PktCaptureError, Result};

/// A captured frame as handed to the sink
///
/// `data` holds the radiotap header immediately followed by the frame and is
/// only valid for the duration of the `deliver` call.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    pub vdev_id: u8,
    pub tid: u8,
    /// Tx completion code, 0 for received frames
    pub status: u8,
    pub format: FrameFormat,
    pub direction: Direction,
    pub src_addr: MacAddr,
    pub retries: u8,
    pub header_len: usize,
    pub data: &'a [u8],
}

impl<'a> CapturedFrame<'a> {
    pub(crate) fn from_wrapper(wrapper: &'a Wrapper) -> Self {
        Self {
            vdev_id: wrapper.vdev_id,
            tid: wrapper.tid,
            status: wrapper.status,
            format: wrapper.format,
            direction: wrapper.direction,
            src_addr: wrapper.src_addr,
            retries: wrapper.retries,
            header_len: wrapper.header_len,
            data: &wrapper.buffer,
        }
    }

    pub fn radiotap(&self) -> &'a [u8] {
        &self.data[..self.header_len.min(self.data.len())]
    }

    pub fn frame(&self) -> &'a [u8] {
        &self.data[self.header_len.min(self.data.len())..]
    }
}

/// Consumer of captured frames
///
/// Called from the worker thread only, one frame at a time in capture
/// order. An error is logged and counted; the frame is not retried.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &CapturedFrame<'_>) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: Fn(&CapturedFrame<'_>) -> Result<()> + Send + Sync,
{
    fn deliver(&self, frame: &CapturedFrame<'_>) -> Result<()> {
        self(frame)
    }
}

/// What happened to a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// Queued for delivery
    Queued,
    /// Interface is shutting down or gone
    Inactive,
    /// Capture mode excludes this frame family
    ModeDisabled,
    /// Rejected by the frame filter
    Filtered,
    /// No sink registered
    NoConsumer,
    /// Frame plus header exceeds the wrapper buffer
    Oversized,
    PoolExhausted,
    QueueFull,
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        *self == SubmitOutcome::Queued
    }
}

/// One frame handed in by a producer path
struct Submission<'a> {
    frame: &'a [u8],
    format: FrameFormat,
    direction: Direction,
    status: PhyStatus<'a>,
    /// Ethernet frames may be re-encapsulated as 802.11
    convertible: bool,
}

/// Capture state of one monitored interface
pub struct PktCaptureVdev {
    vdev_id: u8,
    active: AtomicBool,
    registered: AtomicBool,
    /// Serializes register/deregister and the setters
    control: Mutex<()>,
    mode: ModeState,
    filter: ArcSwap<FrameFilter>,
    bssid: ArcSwapOption<MacAddr>,
    beacons: BeaconSampler,
    controller: Arc<dyn ModeController>,
    header: MetadataHeaderBuilder,
    convert_ethernet: AtomicBool,
    pool: WrapperPool,
    queue: Arc<CaptureQueue>,
    stats: Arc<CaptureStats>,
    worker: Worker,
}

impl PktCaptureVdev {
    /// Allocate the pool and queue and start the delivery worker
    pub fn new(vdev_id: u8, config: &CaptureConfig, controller: Arc<dyn ModeController>) -> Result<Self> {
        let queue = Arc::new(CaptureQueue::new(config.queue_capacity));
        let stats = Arc::new(CaptureStats::new());
        let worker = Worker::spawn(
            &format!("{}-{}", config.worker_name, vdev_id),
            Arc::clone(&queue),
            Arc::clone(&stats),
            WorkerTimeouts {
                suspend: Duration::from_millis(config.suspend_timeout_ms),
                shutdown: Duration::from_millis(config.shutdown_timeout_ms),
            },
        )?;

        log::info!(
            "vdev {}: capture attached (pool {} x {} bytes, queue {})",
            vdev_id,
            config.pool_capacity,
            config.buffer_size,
            config.queue_capacity
        );

        Ok(Self {
            vdev_id,
            active: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            control: Mutex::new(()),
            mode: ModeState::new(),
            filter: ArcSwap::from_pointee(config.default_filter),
            bssid: ArcSwapOption::empty(),
            beacons: BeaconSampler::new(),
            controller,
            header: MetadataHeaderBuilder::new(config.noise_floor_dbm).with_max_len(config.buffer_size),
            convert_ethernet: AtomicBool::new(config.convert_ethernet),
            pool: WrapperPool::with_buffer_size(config.pool_capacity, config.buffer_size),
            queue,
            stats,
            worker,
        })
    }

    pub fn vdev_id(&self) -> u8 {
        self.vdev_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Attach the consumer and push the current capture mode downstream
    pub fn register(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        let _control = self.lock_control();
        if !self.is_active() {
            return Err(PktCaptureError::WorkerStopped);
        }
        if self.is_registered() {
            return Err(PktCaptureError::AlreadyRegistered);
        }

        self.worker.register(sink)?;
        self.registered.store(true, Ordering::Release);

        let mode = self.mode.get();
        if let Err(e) = self.controller.set_capture_mode(self.vdev_id, mode) {
            log::warn!("vdev {}: enabling capture mode {} failed: {}", self.vdev_id, mode, e);
            self.registered.store(false, Ordering::Release);
            if let Err(rollback) = self.worker.unregister() {
                log::warn!("vdev {}: rollback: {}", self.vdev_id, rollback);
            }
            return Err(e);
        }

        log::info!("vdev {}: sink registered, mode {}", self.vdev_id, mode);
        Ok(())
    }

    /// Detach the consumer
    ///
    /// Once this returns `Ok` the sink is never called again and every
    /// queued frame has been released. A `Timeout` means the sink is still
    /// busy with a frame and stays registered.
    pub fn deregister(&self) -> Result<()> {
        let _control = self.lock_control();
        if !self.is_registered() {
            log::debug!("vdev {}: deregister without a sink", self.vdev_id);
            return Ok(());
        }

        match self.worker.unregister() {
            Ok(()) => {}
            Err(e @ PktCaptureError::Timeout(_)) => {
                log::warn!("vdev {}: deregister failed, sink kept: {}", self.vdev_id, e);
                return Err(e);
            }
            // Worker gone: nothing can be delivered anyway
            Err(e) => log::debug!("vdev {}: {}", self.vdev_id, e),
        }
        self.registered.store(false, Ordering::Release);
        let flushed = self.queue.flush();
        self.stats.record_flushed(flushed);

        self.controller
            .set_capture_mode(self.vdev_id, CaptureMode::Disabled)?;
        log::info!("vdev {}: sink deregistered ({} queued frames dropped)", self.vdev_id, flushed);
        Ok(())
    }

    pub fn get_mode(&self) -> CaptureMode {
        self.mode.get()
    }

    /// Change the capture mode; the controller must accept it first
    pub fn set_mode(&self, mode: CaptureMode) -> Result<()> {
        let _control = self.lock_control();
        self.controller.set_capture_mode(self.vdev_id, mode)?;
        let previous = self.mode.set(mode);
        if previous != mode {
            log::info!("vdev {}: capture mode {} -> {}", self.vdev_id, previous, mode);
        }
        Ok(())
    }

    /// How long capture has been enabled
    pub fn mode_active_for(&self) -> Option<Duration> {
        self.mode.active_duration()
    }

    pub fn filter(&self) -> FrameFilter {
        **self.filter.load()
    }

    /// Apply a partial filter update; nothing changes on error
    pub fn set_filter(&self, update: FilterUpdate) -> Result<()> {
        let _control = self.lock_control();
        let filter = update.apply_to(&self.filter.load())?;
        beacon_sampling_period(filter.connected_beacon_interval, self.beacons.beacon_interval())?;
        self.controller.set_frame_filter(self.vdev_id, &filter)?;

        self.filter.store(Arc::new(filter));
        self.beacons.reset();
        log::debug!("vdev {}: filter updated: {:?}", self.vdev_id, filter);
        Ok(())
    }

    /// Beacon interval of the associated BSS, in TU
    pub fn set_beacon_interval(&self, interval_tu: u16) -> Result<()> {
        let _control = self.lock_control();
        beacon_sampling_period(self.filter.load().connected_beacon_interval, interval_tu)?;
        self.beacons.set_beacon_interval(interval_tu);
        Ok(())
    }

    /// BSSID of the associated peer, `None` when disconnected
    pub fn set_bssid(&self, bssid: Option<MacAddr>) {
        match &bssid {
            Some(addr) => log::debug!("vdev {}: associated to {}", self.vdev_id, MacDisplay(addr)),
            None => log::debug!("vdev {}: disassociated", self.vdev_id),
        }
        self.bssid.store(bssid.map(Arc::new));
        self.beacons.reset();
    }

    pub fn bssid(&self) -> Option<MacAddr> {
        self.bssid.load().as_deref().copied()
    }

    /// Toggle Ethernet to 802.11 re-encapsulation of data frames
    pub fn set_convert_ethernet(&self, enabled: bool) {
        self.convert_ethernet.store(enabled, Ordering::Release);
    }

    /// Park delivery; queued frames are kept
    pub fn suspend(&self) -> Result<()> {
        self.worker.suspend()?;
        log::info!("vdev {}: capture suspended", self.vdev_id);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.worker.resume()?;
        log::info!("vdev {}: capture resumed", self.vdev_id);
        Ok(())
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Stop the worker and release every queued frame; idempotent
    pub fn shutdown(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _control = self.lock_control();
        self.registered.store(false, Ordering::Release);
        self.queue.close();

        let stopped = self.worker.shutdown();
        let flushed = self.queue.flush();
        self.stats.record_flushed(flushed);
        log::info!("vdev {}: capture detached ({} queued frames dropped)", self.vdev_id, flushed);
        stopped
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &WrapperPool {
        &self.pool
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Management frame handed to the transmit path
    pub fn mgmt_tx(&self, frame: &[u8], status: &TxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format: FrameFormat::Ieee80211,
            direction: Direction::Outbound,
            status: PhyStatus::Tx(status),
            convertible: false,
        })
    }

    /// Management frame whose transmission completed
    pub fn mgmt_tx_completion(&self, frame: &[u8], status: &TxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format: FrameFormat::Ieee80211,
            direction: Direction::Outbound,
            status: PhyStatus::Tx(status),
            convertible: false,
        })
    }

    pub fn mgmt_rx(&self, frame: &[u8], status: &RxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format: FrameFormat::Ieee80211,
            direction: Direction::Inbound,
            status: PhyStatus::Rx(status),
            convertible: false,
        })
    }

    pub fn data_tx_completion(&self, frame: &[u8], format: FrameFormat, status: &TxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format,
            direction: Direction::Outbound,
            status: PhyStatus::Tx(status),
            convertible: true,
        })
    }

    /// Data frame received from an associated peer
    pub fn data_rx(&self, frame: &[u8], format: FrameFormat, status: &RxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format,
            direction: Direction::Inbound,
            status: PhyStatus::Rx(status),
            convertible: true,
        })
    }

    /// Data frame from a transmitter with no peer entry; kept in its native format
    pub fn data_rx_no_peer(&self, frame: &[u8], format: FrameFormat, status: &RxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format,
            direction: Direction::Inbound,
            status: PhyStatus::Rx(status),
            convertible: false,
        })
    }

    /// Frame the firmware transmitted on its own and reported afterwards
    pub fn offload_tx(&self, frame: &[u8], format: FrameFormat, status: &TxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format,
            direction: Direction::Outbound,
            status: PhyStatus::Tx(status),
            convertible: true,
        })
    }

    /// Frame the firmware received and consumed on its own
    pub fn offload_rx(&self, frame: &[u8], format: FrameFormat, status: &RxStatus) -> SubmitOutcome {
        self.submit(Submission {
            frame,
            format,
            direction: Direction::Inbound,
            status: PhyStatus::Rx(status),
            convertible: true,
        })
    }

    fn submit(&self, submission: Submission<'_>) -> SubmitOutcome {
        if !self.is_active() {
            return SubmitOutcome::Inactive;
        }
        self.stats.record_submitted();

        let mode = self.mode.get();
        let category = classify(submission.frame, submission.format);
        let wanted = match category.macro_category() {
            MacroCategory::Data => mode.includes_data(),
            MacroCategory::Management | MacroCategory::Control => mode.includes_mgmt(),
        };
        if !wanted {
            self.stats.record_mode_disabled();
            return SubmitOutcome::ModeDisabled;
        }

        if !self.passes_filter(category, &submission) {
            self.stats.record_filtered();
            return SubmitOutcome::Filtered;
        }

        // Read before the registration check; a frame stamped for an
        // earlier sink is dropped by the worker.
        let generation = self.worker.generation();
        if !self.is_registered() {
            self.stats.record_no_consumer();
            return SubmitOutcome::NoConsumer;
        }

        let mut wrapper = match self.pool.acquire() {
            Some(wrapper) => wrapper,
            None => {
                self.stats.record_pool_exhausted();
                return SubmitOutcome::PoolExhausted;
            }
        };

        wrapper.generation = generation;
        if let Err(e) = self.fill(&mut wrapper, &submission) {
            log::debug!("vdev {}: frame not captured: {}", self.vdev_id, e);
            self.stats.record_oversized();
            return SubmitOutcome::Oversized;
        }

        match self.queue.push(wrapper) {
            Ok(()) => {
                self.stats.record_queued();
                self.worker.post();
                SubmitOutcome::Queued
            }
            Err(PushError::Full) => {
                self.stats.record_queue_full();
                SubmitOutcome::QueueFull
            }
            Err(PushError::Closed) => SubmitOutcome::Inactive,
        }
    }

    fn passes_filter(&self, category: Category, submission: &Submission<'_>) -> bool {
        let filter = self.filter.load();
        if !should_capture(category, submission.direction, &filter) {
            return false;
        }
        if category != Category::Beacon {
            return true;
        }

        let own_bss = match (self.bssid(), Ieee80211Header::parse(submission.frame)) {
            (Some(bssid), Ok(hdr)) => hdr.addr3() == Some(bssid),
            _ => false,
        };
        self.beacons.admit(own_bss, submission.direction, &filter)
    }

    /// Write metadata, radiotap header and frame into the wrapper
    fn fill(&self, wrapper: &mut Wrapper, submission: &Submission<'_>) -> Result<()> {
        let (tid, status, retries) = match submission.status {
            PhyStatus::Tx(tx) => (tx.tid, tx.completion.code(), tx.retries),
            PhyStatus::Rx(rx) => (rx.tid, 0, 0),
        };
        wrapper.vdev_id = self.vdev_id;
        wrapper.tid = tid;
        wrapper.status = status;
        wrapper.retries = retries;
        wrapper.direction = submission.direction;
        wrapper.format = submission.format;
        wrapper.src_addr = source_address(submission.frame, submission.format).unwrap_or([0; 6]);

        if submission.convertible
            && submission.format == FrameFormat::Ethernet
            && self.convert_ethernet.load(Ordering::Acquire)
        {
            if let Some(bssid) = self.bssid() {
                let ds = match submission.direction {
                    Direction::Outbound => DsDirection::ToDs,
                    Direction::Inbound => DsDirection::FromDs,
                };
                let converted = self.header.build_converted_into(
                    &mut wrapper.buffer,
                    submission.status,
                    submission.frame,
                    ds,
                    bssid,
                );
                if let Ok(header_len) = converted {
                    wrapper.header_len = header_len;
                    wrapper.format = FrameFormat::Ieee80211;
                    return Ok(());
                }
            }
        }

        wrapper.header_len = self
            .header
            .build_into(&mut wrapper.buffer, submission.status, submission.frame)?;
        Ok(())
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn source_address(frame: &[u8], format: FrameFormat) -> Option<MacAddr> {
    match format {
        FrameFormat::Ethernet => EthernetHeader::parse(frame).ok().map(|eth| eth.source()),
        FrameFormat::Ieee80211 => Ieee80211Header::parse(frame).ok().and_then(|hdr| hdr.addr2()),
    }
}

impl Drop for PktCaptureVdev {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("vdev {}: {}", self.vdev_id, e);
        }
    }
}

impl fmt::Debug for PktCaptureVdev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PktCaptureVdev")
            .field("vdev_id", &self.vdev_id)
            .field("active", &self.is_active())
            .field("registered", &self.is_registered())
            .field("mode", &self.get_mode())
            .field("worker", &self.worker_state())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::classify::frames;
    use crate::filter::{ctrl_bits, data_bits, mgmt_bits};
    use radio802::frame::ethertype;
    use radio802::phy::TxCompletion;
    use radio802::RadiotapHeader;
    use std::thread;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn vdev_with(pool_capacity: usize) -> (PktCaptureVdev, Arc<RecordingController>) {
        vdev_with_config(CaptureConfig {
            pool_capacity,
            queue_capacity: pool_capacity,
            ..Default::default()
        })
    }

    fn vdev_with_config(config: CaptureConfig) -> (PktCaptureVdev, Arc<RecordingController>) {
        crate::init_logging();
        let controller = Arc::new(RecordingController::default());
        let vdev = PktCaptureVdev::new(1, &config, controller.clone()).unwrap();
        (vdev, controller)
    }

    fn impatient(pool_capacity: usize) -> CaptureConfig {
        CaptureConfig {
            pool_capacity,
            queue_capacity: pool_capacity,
            suspend_timeout_ms: 50,
            ..Default::default()
        }
    }

    fn capture_everything(vdev: &PktCaptureVdev) {
        vdev.set_mode(CaptureMode::Both).unwrap();
        vdev.set_filter(FilterUpdate::all(FrameFilter::capture_all())).unwrap();
    }

    #[test]
    fn test_arp_only_with_small_pool() {
        let (vdev, _) = vdev_with(4);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        vdev.set_mode(CaptureMode::DataOnly).unwrap();
        vdev.set_filter(FilterUpdate::default().data_rx(data_bits::ARP)).unwrap();

        let status = RxStatus::default();
        let inputs = [
            frames::arp(),
            frames::dhcp(),
            frames::eapol(),
            frames::tcp_syn(),
            frames::icmp(),
        ];
        let outcomes: Vec<SubmitOutcome> = inputs
            .iter()
            .map(|frame| vdev.data_rx(frame, FrameFormat::Ethernet, &status))
            .collect();

        assert_eq!(outcomes[0], SubmitOutcome::Queued);
        assert!(outcomes[1..].iter().all(|o| *o == SubmitOutcome::Filtered));
        assert!(wait_for(|| sink.count() == 1));

        let stats = vdev.stats();
        assert_eq!(stats.filtered, 4);
        assert_eq!(stats.queued, 1);
        assert_eq!(vdev.pool().stats().acquired(), 1);
        assert!(wait_for(|| vdev.pool().available() == 4));
    }

    #[test]
    fn test_delivered_frame_layout() {
        let (vdev, _) = vdev_with(8);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let frame = frames::probe_request();
        let status = RxStatus {
            rssi_comb: 40,
            ..Default::default()
        };
        assert!(vdev.mgmt_rx(&frame, &status).is_queued());
        assert!(wait_for(|| sink.count() == 1));

        let record = &sink.records()[0];
        let (radiotap, len) = RadiotapHeader::parse(&record.data).unwrap();
        assert_eq!(len, record.header_len);
        assert_eq!(radiotap.antenna_signal, Some(-56));
        assert_eq!(&record.data[len..], frame.as_slice());
        assert_eq!(record.direction, Direction::Inbound);
    }

    #[test]
    fn test_mode_gates_frame_families() {
        let (vdev, _) = vdev_with(8);
        vdev.register(Arc::new(RecordingSink::default())).unwrap();
        vdev.set_filter(FilterUpdate::all(FrameFilter::capture_all())).unwrap();

        let rx = RxStatus::default();
        assert_eq!(vdev.mgmt_rx(&frames::probe_request(), &rx), SubmitOutcome::ModeDisabled);

        vdev.set_mode(CaptureMode::DataOnly).unwrap();
        assert_eq!(vdev.mgmt_rx(&frames::probe_request(), &rx), SubmitOutcome::ModeDisabled);
        assert_eq!(vdev.mgmt_rx(&frames::trigger(), &rx), SubmitOutcome::ModeDisabled);
        assert!(vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx).is_queued());

        vdev.set_mode(CaptureMode::ManagementOnly).unwrap();
        assert!(vdev.mgmt_rx(&frames::probe_request(), &rx).is_queued());
        assert_eq!(
            vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx),
            SubmitOutcome::ModeDisabled
        );
    }

    #[test]
    fn test_no_consumer_before_pool() {
        let (vdev, _) = vdev_with(4);
        capture_everything(&vdev);
        let outcome = vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &RxStatus::default());
        assert_eq!(outcome, SubmitOutcome::NoConsumer);
        assert_eq!(vdev.pool().stats().acquired(), 0);
    }

    #[test]
    fn test_pool_exhaustion_drops() {
        let (vdev, _) = vdev_with(2);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);
        vdev.suspend().unwrap();

        let rx = RxStatus::default();
        let outcomes: Vec<_> = (0..5)
            .map(|_| vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx))
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_queued()).count(), 2);
        assert_eq!(
            outcomes.iter().filter(|o| **o == SubmitOutcome::PoolExhausted).count(),
            3
        );
        assert_eq!(vdev.pool().in_flight(), 2);

        vdev.resume().unwrap();
        assert!(wait_for(|| sink.count() == 2));
        assert!(wait_for(|| vdev.pool().available() == 2));
    }

    #[test]
    fn test_ethernet_conversion() {
        let (vdev, _) = vdev_with(8);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let tx = TxStatus::default();
        vdev.data_tx_completion(&frames::arp(), FrameFormat::Ethernet, &tx);
        vdev.set_bssid(Some(frames::AP));
        vdev.data_tx_completion(&frames::arp(), FrameFormat::Ethernet, &tx);
        vdev.data_rx_no_peer(&frames::arp(), FrameFormat::Ethernet, &RxStatus::default());
        assert!(wait_for(|| sink.count() == 3));

        let records = sink.records();
        assert_eq!(records[0].format, FrameFormat::Ethernet);
        assert_eq!(records[1].format, FrameFormat::Ieee80211);
        assert_eq!(records[2].format, FrameFormat::Ethernet);

        let wlan = &records[1].data[records[1].header_len..];
        let hdr = Ieee80211Header::parse(wlan).unwrap();
        assert_eq!(hdr.addr1(), Some(frames::AP));
        assert_eq!(classify(wlan, FrameFormat::Ieee80211), Category::Arp);
    }

    #[test]
    fn test_beacon_sampling_and_scan() {
        let (vdev, _) = vdev_with(32);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        vdev.set_mode(CaptureMode::ManagementOnly).unwrap();
        vdev.set_bssid(Some(frames::AP));
        vdev.set_beacon_interval(100).unwrap();
        vdev.set_filter(
            FilterUpdate::default()
                .mgmt_rx(mgmt_bits::CONNECT_BEACON)
                .connected_beacon_interval(200),
        )
        .unwrap();

        let rx = RxStatus::default();
        let own: Vec<_> = (0..4).map(|_| vdev.mgmt_rx(&frames::beacon(frames::AP), &rx)).collect();
        assert_eq!(
            own,
            vec![
                SubmitOutcome::Queued,
                SubmitOutcome::Filtered,
                SubmitOutcome::Queued,
                SubmitOutcome::Filtered
            ]
        );
        assert_eq!(
            vdev.mgmt_rx(&frames::beacon(frames::OTHER_AP), &rx),
            SubmitOutcome::Filtered
        );

        vdev.set_filter(FilterUpdate::default().mgmt_rx(mgmt_bits::SCAN_BEACON)).unwrap();
        assert!(vdev.mgmt_rx(&frames::beacon(frames::OTHER_AP), &rx).is_queued());
        assert!(wait_for(|| sink.count() == 3));
    }

    #[test]
    fn test_beacon_interval_conflict_rejected() {
        let (vdev, _) = vdev_with(4);
        let update = FilterUpdate::default().connected_beacon_interval(300);
        assert!(matches!(vdev.set_filter(update), Err(PktCaptureError::Config(_))));
        assert_eq!(vdev.filter(), FrameFilter::default());

        vdev.set_beacon_interval(100).unwrap();
        vdev.set_filter(update).unwrap();
        assert!(matches!(vdev.set_beacon_interval(0), Err(PktCaptureError::Config(_))));
    }

    #[test]
    fn test_register_rollback_on_controller_failure() {
        let (vdev, controller) = vdev_with(4);
        controller.fail.store(true, Ordering::Release);
        let result = vdev.register(Arc::new(RecordingSink::default()));
        assert!(matches!(result, Err(PktCaptureError::Controller(_))));
        assert!(!vdev.is_registered());

        controller.fail.store(false, Ordering::Release);
        vdev.register(Arc::new(RecordingSink::default())).unwrap();
        assert!(matches!(
            vdev.register(Arc::new(RecordingSink::default())),
            Err(PktCaptureError::AlreadyRegistered)
        ));
    }

    #[test]
    fn test_set_mode_pushes_to_controller() {
        let (vdev, controller) = vdev_with(4);
        vdev.set_mode(CaptureMode::Both).unwrap();
        assert_eq!(vdev.get_mode(), CaptureMode::Both);
        assert!(vdev.mode_active_for().is_some());

        controller.fail.store(true, Ordering::Release);
        assert!(vdev.set_mode(CaptureMode::DataOnly).is_err());
        assert_eq!(vdev.get_mode(), CaptureMode::Both);
        assert_eq!(controller.modes.lock().unwrap().last(), Some(&(1, CaptureMode::Both)));
    }

    #[test]
    fn test_deregister_while_in_flight() {
        let (vdev, controller) = vdev_with(256);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let vdev = Arc::new(vdev);
        let producer = {
            let vdev = Arc::clone(&vdev);
            thread::spawn(move || {
                let rx = RxStatus::default();
                for _ in 0..2000 {
                    vdev.data_rx(&frames::tcp_syn(), FrameFormat::Ethernet, &rx);
                }
            })
        };

        thread::sleep(Duration::from_millis(2));
        vdev.deregister().unwrap();
        let delivered_at_return = sink.count();
        producer.join().unwrap();
        thread::sleep(Duration::from_millis(20));

        assert_eq!(sink.count(), delivered_at_return);
        assert!(wait_for(|| vdev.pool().available() == 256));
        assert_eq!(
            controller.modes.lock().unwrap().last(),
            Some(&(1, CaptureMode::Disabled))
        );
        // mode is kept for the next registration
        assert_eq!(vdev.get_mode(), CaptureMode::Both);
    }

    #[test]
    fn test_closure_sink() {
        let (vdev, _) = vdev_with(4);
        let (tx, rx) = crossbeam::channel::unbounded();
        vdev.register(Arc::new(move |frame: &CapturedFrame<'_>| {
            tx.send(frame.frame().to_vec())
                .map_err(|e| PktCaptureError::Delivery(e.to_string()))
        }))
        .unwrap();
        vdev.set_mode(CaptureMode::ManagementOnly).unwrap();
        vdev.set_filter(FilterUpdate::default().ctrl_tx(ctrl_bits::TRIGGER)).unwrap();

        let tx_status = TxStatus {
            completion: TxCompletion::Pending,
            ..Default::default()
        };
        assert!(vdev.mgmt_tx(&frames::trigger(), &tx_status).is_queued());
        let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delivered, frames::trigger());
    }

    #[test]
    fn test_failed_delivery_still_releases() {
        let (vdev, _) = vdev_with(4);
        vdev.register(Arc::new(|_: &CapturedFrame<'_>| -> Result<()> {
            Err(PktCaptureError::Delivery("consumer gone".to_string()))
        }))
        .unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        for _ in 0..4 {
            vdev.offload_rx(&frames::eapol(), FrameFormat::Ethernet, &rx);
        }
        assert!(wait_for(|| vdev.stats().delivery_failed == 4));
        assert!(wait_for(|| vdev.pool().available() == 4));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (vdev, _) = vdev_with(16);
        vdev.register(Arc::new(RecordingSink::default())).unwrap();
        capture_everything(&vdev);
        vdev.suspend().unwrap();

        let tx = TxStatus::default();
        for _ in 0..10 {
            vdev.offload_tx(&frames::icmp(), FrameFormat::Ethernet, &tx);
        }
        assert_eq!(vdev.queue_len(), 10);

        vdev.shutdown().unwrap();
        vdev.shutdown().unwrap();
        assert_eq!(vdev.pool().available(), 16);
        assert_eq!(vdev.stats().flushed, 10);
        assert_eq!(
            vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &RxStatus::default()),
            SubmitOutcome::Inactive
        );
        assert_eq!(vdev.worker_state(), WorkerState::Stopped);
    }

    #[test]
    fn test_wlan_data_rx() {
        let (vdev, _) = vdev_with(4);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        vdev.set_mode(CaptureMode::DataOnly).unwrap();
        vdev.set_filter(FilterUpdate::default().data_rx(data_bits::EAPOL)).unwrap();

        let eapol = frames::wlan_data(ethertype::EAPOL, &[0x01, 0x03, 0x00, 0x5f]);
        let status = RxStatus {
            tid: 6,
            ..Default::default()
        };
        assert!(vdev.data_rx(&eapol, FrameFormat::Ieee80211, &status).is_queued());
        assert!(wait_for(|| sink.count() == 1));
        assert_eq!(sink.records()[0].tid, 6);
    }

    #[test]
    fn test_deregister_with_busy_sink_keeps_registration() {
        let (vdev, controller) = vdev_with_config(impatient(16));
        let sink = Arc::new(GateSink::new());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        for _ in 0..10 {
            assert!(vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx).is_queued());
        }
        assert!(wait_for(|| sink.entered()));

        assert!(matches!(vdev.deregister(), Err(PktCaptureError::Timeout(_))));
        assert!(vdev.is_registered());
        assert_eq!(controller.modes.lock().unwrap().last(), Some(&(1, CaptureMode::Both)));

        sink.open();
        assert!(wait_for(|| sink.count() == 10));

        vdev.deregister().unwrap();
        assert_eq!(
            controller.modes.lock().unwrap().last(),
            Some(&(1, CaptureMode::Disabled))
        );
        assert_eq!(
            vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx),
            SubmitOutcome::NoConsumer
        );
        assert!(wait_for(|| vdev.pool().available() == 16));
    }

    #[test]
    fn test_deregister_returns_after_frame_in_sink() {
        let (vdev, _) = vdev_with(16);
        let sink = Arc::new(GateSink::new());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        for _ in 0..10 {
            vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx);
        }
        assert!(wait_for(|| sink.entered()));

        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                sink.open();
            });
            vdev.deregister().unwrap();
        });
        let delivered_at_return = sink.count();
        assert_eq!(delivered_at_return, 1);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.count(), delivered_at_return);
        assert!(wait_for(|| vdev.pool().available() == 16));
        assert!(wait_for(|| {
            let stats = vdev.stats();
            stats.dropped_unregistered + stats.flushed == 9
        }));
    }

    #[test]
    fn test_timed_out_suspend_keeps_delivering() {
        let (vdev, _) = vdev_with_config(impatient(16));
        let sink = Arc::new(GateSink::new());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx);
        assert!(wait_for(|| sink.entered()));

        assert!(matches!(vdev.suspend(), Err(PktCaptureError::Timeout(_))));
        sink.open();
        for _ in 0..5 {
            assert!(vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx).is_queued());
        }
        assert!(wait_for(|| sink.count() == 6));
        assert!(wait_for(|| vdev.worker_state() == WorkerState::Running));
        assert_eq!(vdev.queue_len(), 0);
    }

    #[test]
    fn test_queue_full_before_pool() {
        let (vdev, _) = vdev_with_config(CaptureConfig {
            pool_capacity: 8,
            queue_capacity: 2,
            ..Default::default()
        });
        let sink = Arc::new(GateSink::new());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        assert!(vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx).is_queued());
        // worker holds the first frame inside the sink
        assert!(wait_for(|| sink.entered()));

        let outcomes: Vec<_> = (0..3)
            .map(|_| vdev.data_rx(&frames::arp(), FrameFormat::Ethernet, &rx))
            .collect();
        assert_eq!(
            outcomes,
            vec![SubmitOutcome::Queued, SubmitOutcome::Queued, SubmitOutcome::QueueFull]
        );
        assert_eq!(vdev.stats().queue_full, 1);
        assert_eq!(vdev.pool().in_flight(), 3);

        sink.open();
        assert!(wait_for(|| sink.count() == 3));
        assert!(wait_for(|| vdev.pool().available() == 8));
    }

    #[test]
    fn test_large_mpdu_captured() {
        let (vdev, _) = vdev_with(4);
        let sink = Arc::new(RecordingSink::default());
        vdev.register(sink.clone()).unwrap();
        capture_everything(&vdev);

        let rx = RxStatus::default();
        for size in [radio802::MAX_AMSDU_SIZE, radio802::MAX_MPDU_SIZE] {
            let mut frame = frames::wlan_data(ethertype::ARP, &[]);
            frame.resize(size, 0);
            assert!(vdev.data_rx(&frame, FrameFormat::Ieee80211, &rx).is_queued());
        }
        assert!(wait_for(|| sink.count() == 2));
        let records = sink.records();
        assert_eq!(records[0].data.len() - records[0].header_len, radio802::MAX_AMSDU_SIZE);
        assert_eq!(records[1].data.len() - records[1].header_len, radio802::MAX_MPDU_SIZE);
    }

    #[test]
    fn test_buffer_size_bounds_capture() {
        let (vdev, _) = vdev_with_config(CaptureConfig {
            pool_capacity: 4,
            queue_capacity: 4,
            buffer_size: 4096,
            ..Default::default()
        });
        vdev.register(Arc::new(RecordingSink::default())).unwrap();
        capture_everything(&vdev);

        let mut frame = frames::wlan_data(ethertype::ARP, &[]);
        frame.resize(radio802::MAX_AMSDU_SIZE, 0);
        assert_eq!(
            vdev.data_rx(&frame, FrameFormat::Ieee80211, &RxStatus::default()),
            SubmitOutcome::Oversized
        );
        assert_eq!(vdev.stats().oversized, 1);
        assert_eq!(vdev.pool().available(), 4);
    }

    #[test]
    fn test_late_frame_not_delivered_to_next_sink() {
        let (vdev, _) = vdev_with(8);
        let first = Arc::new(RecordingSink::default());
        vdev.register(first.clone()).unwrap();
        capture_everything(&vdev);
        vdev.suspend().unwrap();

        // a producer that passed the registration check before deregister
        let mut late = vdev.pool.acquire().unwrap();
        late.generation = vdev.worker.generation();
        vdev.deregister().unwrap();
        vdev.queue.push(late).unwrap();

        let second = Arc::new(RecordingSink::default());
        vdev.register(second.clone()).unwrap();
        vdev.resume().unwrap();
        assert!(wait_for(|| vdev.stats().dropped_unregistered == 1));

        assert!(vdev
            .data_rx(&frames::arp(), FrameFormat::Ethernet, &RxStatus::default())
            .is_queued());
        assert!(wait_for(|| second.count() == 1));
        assert_eq!(first.count(), 0);
        assert!(wait_for(|| vdev.pool().available() == 8));
    }
}
