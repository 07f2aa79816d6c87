//! The data model delivered to callers: socket identity, generic inet
//! statistics, and TCP-stack telemetry (see spec §3).

use std::net::IpAddr;

/// Address family of a socket, as reported by `idiag_family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Layer-4 protocol selected for a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub(crate) fn ipproto(self) -> libc::c_int {
        match self {
            Protocol::Tcp => libc::IPPROTO_TCP,
            Protocol::Udp => libc::IPPROTO_UDP,
        }
    }
}

/// Kernel TCP connection states (`net/tcp_states.h`), indices 0..=11.
///
/// Mirrors the states [used internally](https://github.com/iproute2/iproute2/blob/ca756f36a0c6d24ab60657f8d14312c17443e5f0/misc/ss.c#L222-L238)
/// for `ss`. `SYN_RECV`, `TIME_WAIT`, and `CLOSE` are never emitted by this
/// crate (filtered at the netlink request level) but keep their slots so
/// the numeric value still matches the kernel's enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum SocketState {
    Unknown = 0,
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait1 = 4,
    FinWait2 = 5,
    TimeWait = 6,
    Close = 7,
    CloseWait = 8,
    LastAck = 9,
    Listen = 10,
    Closing = 11,
}

impl SocketState {
    /// Builds a state from a raw kernel value, clamping anything outside
    /// the 12-entry name table (e.g. `NEW_SYN_RECV` == 12) to `Unknown`
    /// rather than indexing past the table.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Established,
            2 => Self::SynSent,
            3 => Self::SynRecv,
            4 => Self::FinWait1,
            5 => Self::FinWait2,
            6 => Self::TimeWait,
            7 => Self::Close,
            8 => Self::CloseWait,
            9 => Self::LastAck,
            10 => Self::Listen,
            11 => Self::Closing,
            _ => Self::Unknown,
        }
    }

    /// The `ss`-style name used for `state_name` (spec §6).
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Established => "ESTAB",
            Self::SynSent => "SYN-SENT",
            Self::SynRecv => "SYN-RECV",
            Self::FinWait1 => "FIN-WAIT-1",
            Self::FinWait2 => "FIN-WAIT-2",
            Self::TimeWait => "TIME-WAIT",
            Self::Close => "UNCONN",
            Self::CloseWait => "CLOSE-WAIT",
            Self::LastAck => "LAST-ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
        }
    }
}

/// `idiag_timer` values (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TimerState {
    Off = 0,
    Retransmit = 1,
    Keepalive = 2,
    TimeWait = 3,
    Persist = 4,
    Unknown = 5,
}

impl TimerState {
    /// Clamps any raw value past `Persist` to `Unknown`, the same way the
    /// original clamps `idiag_timer` to `TCP_TIMER_UNKNOWN` before indexing
    /// `tmr_name[]`.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Retransmit,
            2 => Self::Keepalive,
            3 => Self::TimeWait,
            4 => Self::Persist,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Retransmit => "ON",
            Self::Keepalive => "KEEPALIVE",
            Self::TimeWait => "TIME-WAIT",
            Self::Persist => "PERSIST",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Which endpoint a port-filter leaf constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Src,
    Dst,
}

/// A declarative port-filter expression tree (spec §3/§4.2). Compiled by
/// [`crate::filter::compile`] into kernel bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFilterExpr {
    Le(Side, u16),
    Ge(Side, u16),
    Eq(Side, u16),
    And(Box<PortFilterExpr>, Box<PortFilterExpr>),
    Or(Box<PortFilterExpr>, Box<PortFilterExpr>),
    Not(Box<PortFilterExpr>),
}

/// Collection filter passed to [`crate::collect_sock_stat`].
#[derive(Debug, Clone, Default)]
pub struct SockFilter {
    /// Families to enumerate; empty means both v4 and v6.
    pub families: Vec<AddressFamily>,
    /// Protocols to enumerate; empty means both tcp and udp.
    pub protocols: Vec<Protocol>,
    pub only_current_user: bool,
    pub only_current_process: bool,
    /// Optional port-filter expression, compiled to bytecode per dump.
    pub ports: Option<PortFilterExpr>,
    /// Expected bytecode node count for `ports`, checked against the
    /// compiler's own count before the request is sent (spec §4.5/§7).
    pub expected_node_count: Option<usize>,
}

impl SockFilter {
    pub(crate) fn families_or_both(&self) -> Vec<AddressFamily> {
        if self.families.is_empty() {
            vec![AddressFamily::V4, AddressFamily::V6]
        } else {
            self.families.clone()
        }
    }

    pub(crate) fn protocols_or_both(&self) -> Vec<Protocol> {
        if self.protocols.is_empty() {
            vec![Protocol::Tcp, Protocol::Udp]
        } else {
            self.protocols.clone()
        }
    }
}

/// A single inode → pid observation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidEntry {
    pub inode: u32,
    pub pid: i32,
}

/// Per-socket generic inet statistics (spec §3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct InetSockStat {
    pub local_address: String,
    pub remote_address: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub family: AddressFamily,
    pub conn_state: u8,
    pub state_name: &'static str,
    pub pid: Option<i32>,
    pub uid: u32,
    pub username: Option<String>,
    pub request_queue: u32,
    pub waiting_queue: u32,
    pub rcv_queue_mem: u32,
    pub snd_queue_mem: u32,
    pub rcv_sock_buf: u32,
    pub snd_sock_buf: u32,
    pub tcp_fwd_alloc: u32,
    pub tcp_queued_mem: u32,
    pub backlog_packets: u32,
}

/// Per-socket TCP-stack telemetry (spec §3). `None` fields are the
/// sentinel-suppressed values (default/unconfirmed cwnd, capped ssthresh,
/// the 3s RTO default, etc.) rather than `0`, so callers can distinguish
/// "not reported" from "reported as zero."
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TcpStat {
    pub options: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub snd_wnd_scale: Option<u8>,
    pub rcv_wnd_scale: Option<u8>,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub retransmit_timeout: Option<u32>,
    pub acknowledge_timeout: u32,
    pub round_trip_time: u32,
    pub round_trip_time_var: u32,
    pub total_retrans: u32,
    pub snd_cwnd: Option<u32>,
    pub snd_ssthresh: Option<u32>,
    pub snd_bandwidth: Option<f64>,
    pub rcv_rrt: u32,
    pub rcv_space: u32,
    pub timer: u8,
    pub timer_name: &'static str,
    pub timer_retransmits: u8,
    pub timer_timeout: u32,
}

impl TcpStat {
    pub(crate) fn new() -> Self {
        Self {
            timer: TimerState::Off as u8,
            timer_name: TimerState::Off.name(),
            ..Default::default()
        }
    }
}

/// Parses an address out of the 4x`u32` netlink wire representation
/// (`idiag_src`/`idiag_dst`), network byte order within each word.
pub(crate) fn addr_from_words(words: [u32; 4], family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::from(words[0].to_be_bytes()),
        AddressFamily::V6 => {
            let mut bytes = [0u8; 16];
            for (i, word) in words.iter().enumerate() {
                bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
            }
            IpAddr::from(bytes)
        }
    }
}
