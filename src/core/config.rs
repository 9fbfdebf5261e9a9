//! Stack configuration.
//!
//! Environment variables read by [`NdConfig::from_env`]:
//! - ND_RCVBUF / ND_SNDBUF: per-connection buffer sizes in bytes
//! - ND_MEM_BUDGET: process-wide memory budget in quanta
//! - ND_SEGMENT_CAP: payload bytes per data segment
//! - ND_MAX_GSO_DATA: grant granularity in bytes
//! - ND_MAX_GRANT_BATCH: upper bound of a single grant in bytes
//! - ND_ACK_DIVISOR: ACK every `max_grant_batch / divisor` bytes
//! - ND_FLOW_WAIT_MS: flow-wait timeout in milliseconds
//! - ND_CORES: number of scheduler cores
//! - ND_TOTAL_CHANNELS: channels per peer
//! - ND_LATENCY_SPLIT: first channel index of the latency class
//! - ND_LISTEN_ADDR: listen address of the multiplexing target
//! - ND_LOCAL_IP: source address for outbound channels

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use super::constants::*;
use super::error::{NdError, NdResult};

/// Configuration shared by the engine and the multiplexing layer.
#[derive(Debug, Clone)]
pub struct NdConfig {
    /// Per-connection receive buffer in bytes.
    pub rcvbuf: usize,
    /// Per-connection send buffer in bytes.
    pub sndbuf: usize,
    /// Process-wide memory budget in quanta. Watermarks derive from it.
    pub mem_budget: usize,
    /// Payload bytes per data segment.
    pub segment_cap: usize,
    /// Grant granularity in bytes.
    pub max_gso_data: usize,
    /// Upper bound of a single grant in bytes.
    pub max_grant_batch: usize,
    /// A cumulative ACK is sent every `max_grant_batch / ack_divisor` bytes.
    pub ack_divisor: usize,
    /// Silence on a granted flow before the receiver nudges the sender.
    pub flow_wait_timeout: Duration,
    /// Time allowed for a SYNC to be answered.
    pub connect_timeout: Duration,
    /// Send timeout; `None` waits forever.
    pub send_timeout: Option<Duration>,
    /// Receive timeout; `None` waits forever.
    pub recv_timeout: Option<Duration>,
    /// Number of per-core scheduler entries.
    pub cores: usize,
    /// Channels opened per peer by the multiplexing host.
    pub total_channels: usize,
    /// First channel index of the latency class.
    pub latency_split: usize,
    /// Worker index stride between consecutive queues.
    pub cpu_stride: usize,
    /// I/O workers per priority class.
    pub io_workers: usize,
    /// Segments framed per receive pass.
    pub recv_budget: usize,
    /// Send-list entries flushed per pass.
    pub send_budget: usize,
    /// Operations per I/O task run before re-queueing.
    pub io_work_budget: usize,
    /// Listen address of the multiplexing target.
    pub listen_addr: SocketAddr,
    /// Source address for outbound channels.
    pub local_ip: Option<IpAddr>,
}

impl Default for NdConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            rcvbuf: DEFAULT_RCVBUF,
            sndbuf: DEFAULT_SNDBUF,
            mem_budget: DEFAULT_MEM_BUDGET,
            segment_cap: DEFAULT_SEGMENT_CAP,
            max_gso_data: DEFAULT_MAX_GSO_DATA,
            max_grant_batch: DEFAULT_MAX_GRANT_BATCH,
            ack_divisor: DEFAULT_ACK_DIVISOR,
            flow_wait_timeout: DEFAULT_FLOW_WAIT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: None,
            recv_timeout: None,
            cores,
            total_channels: DEFAULT_TOTAL_CHANNELS,
            latency_split: DEFAULT_TOTAL_CHANNELS / 2,
            cpu_stride: DEFAULT_CPU_STRIDE,
            io_workers: DEFAULT_IO_WORKERS,
            recv_budget: RECV_BUDGET,
            send_budget: SEND_BUDGET,
            io_work_budget: IO_WORK_BUDGET,
            listen_addr: DEFAULT_LISTEN_ADDR,
            local_ip: None,
        }
    }
}

impl NdConfig {
    /// Defaults overridden by any `ND_*` environment variables present.
    pub fn from_env() -> NdResult<Self> {
        let mut config = Self::default();
        read_env("ND_RCVBUF", &mut config.rcvbuf)?;
        read_env("ND_SNDBUF", &mut config.sndbuf)?;
        read_env("ND_MEM_BUDGET", &mut config.mem_budget)?;
        read_env("ND_SEGMENT_CAP", &mut config.segment_cap)?;
        read_env("ND_MAX_GSO_DATA", &mut config.max_gso_data)?;
        read_env("ND_MAX_GRANT_BATCH", &mut config.max_grant_batch)?;
        read_env("ND_ACK_DIVISOR", &mut config.ack_divisor)?;
        read_env("ND_CORES", &mut config.cores)?;
        read_env("ND_LISTEN_ADDR", &mut config.listen_addr)?;

        if read_env("ND_TOTAL_CHANNELS", &mut config.total_channels)? {
            config.latency_split = config.total_channels / 2;
        }
        read_env("ND_LATENCY_SPLIT", &mut config.latency_split)?;

        let mut wait_ms = config.flow_wait_timeout.as_millis() as u64;
        if read_env("ND_FLOW_WAIT_MS", &mut wait_ms)? {
            config.flow_wait_timeout = Duration::from_millis(wait_ms);
        }

        let mut local_ip = IpAddr::from([0, 0, 0, 0]);
        if read_env("ND_LOCAL_IP", &mut local_ip)? {
            config.local_ip = Some(local_ip);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> NdResult<()> {
        if self.segment_cap == 0 || self.segment_cap > MAX_SEGMENT_PAYLOAD {
            return Err(NdError::Config(format!(
                "segment_cap must be in 1..={MAX_SEGMENT_PAYLOAD}, got {}",
                self.segment_cap
            )));
        }
        if self.max_gso_data < self.segment_cap {
            return Err(NdError::Config(
                "max_gso_data must be at least segment_cap".into(),
            ));
        }
        if self.max_grant_batch < self.max_gso_data {
            return Err(NdError::Config(
                "max_grant_batch must be at least max_gso_data".into(),
            ));
        }
        if self.rcvbuf < self.max_grant_batch {
            return Err(NdError::Config(
                "rcvbuf must hold at least one grant batch".into(),
            ));
        }
        if self.sndbuf < self.segment_cap {
            return Err(NdError::Config("sndbuf must hold one segment".into()));
        }
        if self.ack_divisor == 0 {
            return Err(NdError::Config("ack_divisor must be non-zero".into()));
        }
        if self.cores == 0 || self.io_workers == 0 {
            return Err(NdError::Config("cores and io_workers must be non-zero".into()));
        }
        if self.total_channels == 0 || self.latency_split >= self.total_channels {
            return Err(NdError::Config(
                "latency_split must leave at least one latency channel".into(),
            ));
        }
        if self.recv_budget == 0 || self.send_budget == 0 || self.io_work_budget == 0 {
            return Err(NdError::Config("I/O budgets must be non-zero".into()));
        }
        Ok(())
    }

    /// Pool watermarks `[low, default, high]` in quanta.
    pub fn mem_limits(&self) -> [usize; 3] {
        let limit = (self.mem_budget / 8).max(MIN_MEM_LIMIT);
        let low = limit / 4 * 3;
        [low, limit, low * 2]
    }

    /// Bytes received before a cumulative ACK is due.
    pub fn ack_interval(&self) -> usize {
        self.max_grant_batch / self.ack_divisor
    }
}

fn read_env<T: FromStr>(name: &str, slot: &mut T) -> NdResult<bool> {
    match env::var(name) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| NdError::Config(format!("{name}: cannot parse {raw:?}")))?;
            Ok(true)
        }
        Err(env::VarError::NotPresent) => Ok(false),
        Err(env::VarError::NotUnicode(_)) => {
            Err(NdError::Config(format!("{name}: not valid unicode")))
        }
    }
}

/// Builder for [`NdConfig`].
#[derive(Debug, Clone, Default)]
pub struct NdConfigBuilder {
    config: NdConfig,
}

impl NdConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive buffer size.
    pub fn rcvbuf(mut self, bytes: usize) -> Self {
        self.config.rcvbuf = bytes;
        self
    }

    /// Set the send buffer size.
    pub fn sndbuf(mut self, bytes: usize) -> Self {
        self.config.sndbuf = bytes;
        self
    }

    /// Set the process-wide memory budget in quanta.
    pub fn mem_budget(mut self, quanta: usize) -> Self {
        self.config.mem_budget = quanta;
        self
    }

    /// Set the payload size of data segments.
    pub fn segment_cap(mut self, bytes: usize) -> Self {
        self.config.segment_cap = bytes;
        self
    }

    /// Set the grant granularity.
    pub fn max_gso_data(mut self, bytes: usize) -> Self {
        self.config.max_gso_data = bytes;
        self
    }

    /// Set the grant batch bound.
    pub fn max_grant_batch(mut self, bytes: usize) -> Self {
        self.config.max_grant_batch = bytes;
        self
    }

    /// Set the ACK cadence divisor.
    pub fn ack_divisor(mut self, divisor: usize) -> Self {
        self.config.ack_divisor = divisor;
        self
    }

    /// Set the flow-wait timeout.
    pub fn flow_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.flow_wait_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the send timeout.
    pub fn send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Set the receive timeout.
    pub fn recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.recv_timeout = timeout;
        self
    }

    /// Set the number of scheduler cores.
    pub fn cores(mut self, cores: usize) -> Self {
        self.config.cores = cores;
        self
    }

    /// Set the channel count; the latency split moves to half of it.
    pub fn total_channels(mut self, channels: usize) -> Self {
        self.config.total_channels = channels;
        self.config.latency_split = channels / 2;
        self
    }

    /// Set the first latency channel index.
    pub fn latency_split(mut self, index: usize) -> Self {
        self.config.latency_split = index;
        self
    }

    /// Set the worker stride.
    pub fn cpu_stride(mut self, stride: usize) -> Self {
        self.config.cpu_stride = stride;
        self
    }

    /// Set the number of I/O workers per class.
    pub fn io_workers(mut self, workers: usize) -> Self {
        self.config.io_workers = workers;
        self
    }

    /// Set the I/O task budgets.
    pub fn budgets(mut self, recv: usize, send: usize, io_work: usize) -> Self {
        self.config.recv_budget = recv;
        self.config.send_budget = send;
        self.config.io_work_budget = io_work;
        self
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the source address of outbound channels.
    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.config.local_ip = Some(ip);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> NdResult<NdConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
