//! Capture pipeline replay tool
//!
//! Attaches the capture pipeline to a synthetic interface, replays a mix of
//! management, control and data frames through the producer paths and
//! prints the resulting counters as JSON.

use wlan_pktcapture::{
    filter::{ctrl_bits, mgmt_bits},
    mode::LoggingController,
    CaptureConfig, CaptureMode, CapturedFrame, ConfigManager, FilterUpdate, FrameFormat,
    FrameSink, MonitorContext, PktCaptureError, PktCaptureVdev, Result, RxStatus, SubmitOutcome,
    TxStatus,
};
use clap::{Arg, Command};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Default number of frames to replay
const DEFAULT_FRAME_COUNT: &str = "1000";

/// Interface id used for the replay
const REPLAY_VDEV_ID: u8 = 0;

/// Beacon interval of the synthetic BSS, in TU
const REPLAY_BEACON_INTERVAL: u16 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("pktcapture")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Replay synthetic WLAN traffic through the monitor-capture pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (toml, json or yaml)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error); overrides the config file"),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("N")
                .help("Number of frames to replay")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_FRAME_COUNT),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Capture mode (disabled, mgmt, data, both)")
                .default_value("both"),
        )
        .arg(
            Arg::new("data-filter")
                .short('f')
                .long("data-filter")
                .value_name("HEX")
                .help("Data filter mask applied in both directions")
                .default_value("0x1"),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => load_configuration(&PathBuf::from(path))?,
        None => CaptureConfig::default(),
    };

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .or_else(|| Some(config.logging.level.clone()).filter(|level| !level.is_empty()))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    init_logging(&log_level)?;

    info!("Starting pktcapture v{}", env!("CARGO_PKG_VERSION"));

    let frames = matches.get_one::<usize>("frames").copied().unwrap_or(1000);
    let mode: CaptureMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("both")
        .parse()?;
    let data_filter = parse_mask(
        matches
            .get_one::<String>("data-filter")
            .map(String::as_str)
            .unwrap_or("0x1"),
    )?;

    match run_replay(config, mode, data_filter, frames).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            Ok(())
        }
        Err(e) => {
            error!("replay failed: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize logging system
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| PktCaptureError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| PktCaptureError::System(format!("Failed to install subscriber: {}", e)))
}

/// Load capture configuration from file
fn load_configuration(config_path: &PathBuf) -> Result<CaptureConfig> {
    if !config_path.exists() {
        warn!("Configuration file not found: {}, using defaults", config_path.display());
        return Ok(CaptureConfig::default());
    }
    let manager = ConfigManager::load_from_file(config_path)?;
    Ok(manager.get_config().clone())
}

/// Parse a filter mask given as hex (`0x` prefix optional)
fn parse_mask(text: &str) -> Result<u32> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16)
        .map_err(|e| PktCaptureError::InvalidParameter(format!("filter mask '{}': {}", text, e)))
}

/// Counts what reaches the consumer
#[derive(Debug, Default)]
struct ReplaySink {
    ethernet: AtomicU64,
    ieee80211: AtomicU64,
    bytes: AtomicU64,
}

impl FrameSink for ReplaySink {
    fn deliver(&self, frame: &CapturedFrame<'_>) -> Result<()> {
        let counter = match frame.format {
            FrameFormat::Ethernet => &self.ethernet,
            FrameFormat::Ieee80211 => &self.ieee80211,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        tracing::trace!(
            vdev = frame.vdev_id,
            direction = %frame.direction,
            len = frame.data.len(),
            "frame delivered"
        );
        Ok(())
    }
}

/// Attach, replay, drain, detach; returns the JSON report
async fn run_replay(
    config: CaptureConfig,
    mode: CaptureMode,
    data_filter: u32,
    frames: usize,
) -> Result<serde_json::Value> {
    let drain_timeout = Duration::from_millis(config.shutdown_timeout_ms);
    let context = Arc::new(MonitorContext::new(config, Arc::new(LoggingController)));
    let vdev = context.on_vdev_create(REPLAY_VDEV_ID)?;
    let session = context.session_id();

    let sink = Arc::new(ReplaySink::default());
    vdev.register(sink.clone())?;
    vdev.set_mode(mode)?;
    vdev.set_bssid(Some(synthetic::BSSID));
    vdev.set_beacon_interval(REPLAY_BEACON_INTERVAL)?;
    vdev.set_filter(
        FilterUpdate::default()
            .data_tx(data_filter)
            .data_rx(data_filter)
            .mgmt_tx(mgmt_bits::ALL)
            .mgmt_rx(mgmt_bits::CONNECT_NO_BEACON | mgmt_bits::CONNECT_BEACON)
            .ctrl_tx(ctrl_bits::TRIGGER)
            .ctrl_rx(ctrl_bits::TRIGGER)
            .connected_beacon_interval(u32::from(REPLAY_BEACON_INTERVAL) * 10),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let vdev = Arc::clone(&vdev);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || replay(&vdev, frames, &stop))
    };

    let outcomes = tokio::select! {
        joined = producer => joined.map_err(|e| PktCaptureError::System(e.to_string()))?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping replay");
            stop.store(true, Ordering::Release);
            BTreeMap::new()
        }
    };

    if !wait_for_drain(&vdev, drain_timeout).await {
        warn!("{} frames still pending at teardown", vdev.stats().pending());
    }

    let stats = vdev.stats();
    context.on_vdev_destroy(REPLAY_VDEV_ID)?;
    info!(
        "replayed {} frames, {} delivered",
        stats.submitted,
        stats.delivered
    );

    Ok(json!({
        "session": session,
        "vdev": REPLAY_VDEV_ID,
        "mode": mode.to_string(),
        "outcomes": outcomes,
        "delivered": {
            "ethernet": sink.ethernet.load(Ordering::Relaxed),
            "ieee80211": sink.ieee80211.load(Ordering::Relaxed),
            "bytes": sink.bytes.load(Ordering::Relaxed),
        },
        "stats": stats,
    }))
}

/// Push `frames` synthetic frames through the producer paths
fn replay(vdev: &PktCaptureVdev, frames: usize, stop: &AtomicBool) -> BTreeMap<String, u64> {
    let mut outcomes = BTreeMap::new();
    let tx = TxStatus::default();
    let mut rx = RxStatus {
        rssi_comb: 42,
        ..Default::default()
    };

    for i in 0..frames {
        if stop.load(Ordering::Acquire) {
            break;
        }
        rx.tsf = i as u64 * 1024;

        let outcome = match i % 10 {
            0 => vdev.mgmt_rx(&synthetic::beacon(synthetic::BSSID), &rx),
            1 => vdev.mgmt_rx(&synthetic::beacon(synthetic::FOREIGN_BSSID), &rx),
            2 => vdev.mgmt_tx(&synthetic::probe_request(), &tx),
            3 => vdev.mgmt_rx(&synthetic::trigger(), &rx),
            4 => vdev.data_tx_completion(&synthetic::arp(), FrameFormat::Ethernet, &tx),
            5 => vdev.data_rx(&synthetic::dhcp(), FrameFormat::Ethernet, &rx),
            6 => vdev.data_rx(&synthetic::dns_query(), FrameFormat::Ethernet, &rx),
            7 => vdev.data_tx_completion(&synthetic::tcp_syn(), FrameFormat::Ethernet, &tx),
            8 => vdev.data_rx_no_peer(&synthetic::icmp(), FrameFormat::Ethernet, &rx),
            _ => vdev.offload_tx(&synthetic::eapol(), FrameFormat::Ethernet, &tx),
        };
        *outcomes.entry(outcome_name(outcome)).or_insert(0) += 1;
    }
    outcomes
}

fn outcome_name(outcome: SubmitOutcome) -> String {
    format!("{:?}", outcome)
}

async fn wait_for_drain(vdev: &PktCaptureVdev, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while vdev.stats().pending() > 0 {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// Frames used by the replay
mod synthetic {
    pub const BSSID: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x00, 0x01];
    pub const FOREIGN_BSSID: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x00, 0x99];
    const STA: [u8; 6] = [0x02, 0x00, 0x5e, 0x20, 0x00, 0x02];

    fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + payload.len());
        frame.extend_from_slice(&BSSID);
        frame.extend_from_slice(&STA);
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4(protocol: u8, transport: &[u8]) -> Vec<u8> {
        let total = (20 + transport.len()) as u16;
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0x12, 0x34, 0x40, 0x00, 64, protocol, 0, 0]);
        packet.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 1]);
        packet.extend_from_slice(transport);
        packet
    }

    fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(payload);
        segment
    }

    fn mgmt(subtype: u8, addr1: [u8; 6], addr2: [u8; 6], addr3: [u8; 6], body: &[u8]) -> Vec<u8> {
        let mut frame = vec![subtype << 4, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&addr1);
        frame.extend_from_slice(&addr2);
        frame.extend_from_slice(&addr3);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(body);
        frame
    }

    pub fn beacon(bssid: [u8; 6]) -> Vec<u8> {
        // timestamp, interval 100 TU, capabilities
        let mut body = vec![0u8; 8];
        body.extend_from_slice(&[0x64, 0x00, 0x01, 0x04]);
        mgmt(8, [0xff; 6], bssid, bssid, &body)
    }

    pub fn probe_request() -> Vec<u8> {
        mgmt(4, [0xff; 6], STA, [0xff; 6], &[0x00, 0x00])
    }

    pub fn trigger() -> Vec<u8> {
        let mut frame = vec![0x24, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&BSSID);
        frame.extend_from_slice(&[0u8; 8]);
        frame
    }

    pub fn arp() -> Vec<u8> {
        ethernet(0x0806, &[0u8; 28])
    }

    pub fn eapol() -> Vec<u8> {
        ethernet(0x888e, &[0x02, 0x03, 0x00, 0x5f])
    }

    pub fn dhcp() -> Vec<u8> {
        ethernet(0x0800, &ipv4(17, &udp(67, 68, &[0x02, 0x01, 0x06, 0x00])))
    }

    pub fn dns_query() -> Vec<u8> {
        ethernet(0x0800, &ipv4(17, &udp(53_001, 53, &[0xab, 0xcd, 0x01, 0x00])))
    }

    pub fn tcp_syn() -> Vec<u8> {
        let mut segment = vec![0xc3, 0x50, 0x01, 0xbb];
        segment.extend_from_slice(&[0; 8]);
        segment.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
        ethernet(0x0800, &ipv4(6, &segment))
    }

    pub fn icmp() -> Vec<u8> {
        ethernet(0x0800, &ipv4(1, &[8, 0, 0, 0, 0, 1, 0, 1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlan_pktcapture::{classify, Category};

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_LOG_LEVEL, "info");
        assert_eq!(DEFAULT_FRAME_COUNT, "1000");
    }

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("0x1").unwrap(), 1);
        assert_eq!(parse_mask("2A").unwrap(), 0x2a);
        assert_eq!(parse_mask(" 0XFFFF ").unwrap(), 0xffff);
        assert!(parse_mask("zz").is_err());
    }

    #[test]
    fn test_synthetic_frames_classify() {
        let eth = FrameFormat::Ethernet;
        let wlan = FrameFormat::Ieee80211;
        assert_eq!(classify(&synthetic::arp(), eth), Category::Arp);
        assert_eq!(classify(&synthetic::dhcp(), eth), Category::DhcpV4);
        assert_eq!(classify(&synthetic::dns_query(), eth), Category::DnsQueryV4);
        assert_eq!(classify(&synthetic::tcp_syn(), eth), Category::TcpSyn);
        assert_eq!(classify(&synthetic::icmp(), eth), Category::IcmpV4);
        assert_eq!(classify(&synthetic::eapol(), eth), Category::Eapol);
        assert_eq!(classify(&synthetic::beacon(synthetic::BSSID), wlan), Category::Beacon);
        assert_eq!(classify(&synthetic::probe_request(), wlan), Category::Management);
        assert_eq!(classify(&synthetic::trigger(), wlan), Category::Trigger);
    }

    #[tokio::test]
    async fn test_load_nonexistent_config() {
        let path = PathBuf::from("/nonexistent/pktcapture.toml");
        let config = load_configuration(&path).unwrap();
        assert_eq!(config, CaptureConfig::default());
    }

    #[tokio::test]
    async fn test_replay_report() {
        let config = CaptureConfig {
            pool_capacity: 64,
            queue_capacity: 64,
            ..Default::default()
        };
        let report = run_replay(config, CaptureMode::Both, 0x1, 200).await.unwrap();

        let stats = &report["stats"];
        assert_eq!(stats["submitted"], 200);
        let outcomes = report["outcomes"].as_object().unwrap();
        let total: u64 = outcomes.values().map(|v| v.as_u64().unwrap()).sum();
        assert_eq!(total, 200);
        // foreign beacons are never captured with this filter
        assert!(stats["filtered"].as_u64().unwrap() >= 20);
        assert!(stats["delivered"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_replay_disabled_mode() {
        let config = CaptureConfig {
            pool_capacity: 8,
            queue_capacity: 8,
            ..Default::default()
        };
        let report = run_replay(config, CaptureMode::Disabled, 0x1, 50).await.unwrap();
        assert_eq!(report["stats"]["mode_disabled"], 50);
        assert_eq!(report["delivered"]["ethernet"], 0);
    }
}
