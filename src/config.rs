use std::time::Duration;

/// Tunable constants for the transport.
///
/// `Config::default()` reproduces every constant this protocol hard-codes, so
/// a caller that never touches a `Config` observes the baseline behavior.
/// Tests shrink the timers and windows below to avoid sleeping in real
/// wall-clock time; this struct is not deserialized from a file — the
/// transport has no CLI and no filesystem surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub mtu: usize,
    pub fragment_header_reserve: usize,
    pub loss: LossConfig,
    pub fec: FecConfig,
    pub pacer: PacerConfig,
    pub nack: NackConfig,
    pub rtt: RttConfig,
    pub keepalive: KeepaliveConfig,
    pub housekeeping: HousekeepingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1200,
            fragment_header_reserve: 200,
            loss: LossConfig::default(),
            fec: FecConfig::default(),
            pacer: PacerConfig::default(),
            nack: NackConfig::default(),
            rtt: RttConfig::default(),
            keepalive: KeepaliveConfig::default(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl Config {
    /// Payload budget for one RTP fragment, leaving `fragment_header_reserve`
    /// bytes of headroom under `mtu` for headers.
    pub fn fragment_payload_budget(&self) -> usize {
        self.mtu - self.fragment_header_reserve
    }
}

#[derive(Debug, Clone)]
pub struct LossConfig {
    pub window: Duration,
    pub rise_current_weight: f64,
    pub rise_sample_weight: f64,
    pub fall_current_weight: f64,
    pub fall_sample_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            rise_current_weight: 0.8,
            rise_sample_weight: 0.2,
            fall_current_weight: 0.95,
            fall_sample_weight: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FecConfig {
    /// (loss_rate_upper_bound, group_size), checked in order; the first
    /// bound the current loss rate is strictly below wins.
    pub group_size_table: [(f64, usize); 4],
    pub high_srtt_threshold: Duration,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            group_size_table: [(0.01, 0), (0.05, 10), (0.15, 5), (f64::INFINITY, 3)],
            high_srtt_threshold: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// (loss_rate_upper_bound, packets_per_second), same convention as
    /// `FecConfig::group_size_table`.
    pub rate_table: [(f64, u32); 4],
    pub tick: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            rate_table: [(0.01, 2000), (0.05, 1500), (0.10, 1000), (f64::INFINITY, 750)],
            tick: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NackConfig {
    pub gap_ignore_threshold: u64,
    pub max_retransmissions: u32,
    pub max_age: Duration,
    pub check_interval: Duration,
    pub initial_delay_low_srtt: Duration,
    pub initial_delay_high_srtt: Duration,
    pub high_srtt_threshold: Duration,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self {
            gap_ignore_threshold: 100,
            max_retransmissions: 5,
            max_age: Duration::from_secs(5),
            check_interval: Duration::from_millis(10),
            initial_delay_low_srtt: Duration::from_millis(20),
            initial_delay_high_srtt: Duration::from_millis(60),
            high_srtt_threshold: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RttConfig {
    pub alpha: f64,
    pub beta: f64,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub min_rttvar_floor: Duration,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            alpha: 0.125,
            beta: 0.25,
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_millis(2000),
            min_rttvar_floor: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_missed_pongs: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(200),
            ping_timeout: Duration::from_secs(1),
            max_missed_pongs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_age: Duration::from_secs(5),
        }
    }
}
