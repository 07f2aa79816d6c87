//! Attribute decoder (C4): turns a [`crate::netlink::DiagMessage`] plus
//! its rtattr chain into the public [`InetSockStat`]/[`TcpStat`] pair,
//! applying the sentinel-suppression rules and short-payload tolerance
//! from spec §4.4/§6.

use crate::inode_index::InodeIndex;
use crate::netlink::{self, Attr, DiagMessage};
use crate::types::{addr_from_words, AddressFamily, InetSockStat, SocketState, TcpStat, TimerState};

/// RTO reported as exactly this many microseconds means "unset" (the
/// kernel's default 3s timeout applied before a real RTT sample exists).
const RTO_UNSET_USECS: u32 = 3_000_000;
/// `snd_cwnd == 2` is the kernel's unconfirmed startup value.
const CWND_UNSET: u32 = 2;
/// Any `snd_ssthresh` at or above this is the "infinite" sentinel.
const SSTHRESH_UNSET_FLOOR: u32 = 0xFFFF;
/// `tcpi_rtt == 0x7FFFFFFF` marks vegas RTT as not sampled.
const VEGAS_RTT_UNSET: u32 = 0x7FFF_FFFF;
/// `TCPI_OPT_WSCALE` bit in `tcpi_options`: set once the window-scale
/// option has actually been negotiated.
const TCPI_OPT_WSCALE: u8 = 1 << 2;

/// Reads a native-endian `u32` at `offset`, treating any offset beyond
/// `buf`'s length as zero — this is how a truncated `TCP_INFO`/
/// `SKMEMINFO` payload from an older kernel is tolerated (spec §4.4).
fn u32_at(buf: &[u8], offset: usize) -> u32 {
    if offset + 4 > buf.len() {
        return 0;
    }
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn u8_at(buf: &[u8], offset: usize) -> u8 {
    buf.get(offset).copied().unwrap_or(0)
}

/// `struct tcp_info` field offsets, fixed by the kernel uAPI up through
/// `tcpi_total_retrans` (later fields are unused here).
mod tcp_info_offsets {
    pub const STATE: usize = 0;
    pub const CA_STATE: usize = 1;
    pub const RETRANSMITS: usize = 2;
    pub const PROBES: usize = 3;
    pub const BACKOFF: usize = 4;
    pub const OPTIONS: usize = 5;
    pub const WSCALE: usize = 6;
    pub const RTO: usize = 8;
    pub const ATO: usize = 12;
    pub const SND_MSS: usize = 16;
    pub const RCV_MSS: usize = 20;
    pub const PMTU: usize = 60;
    pub const RCV_SSTHRESH: usize = 64;
    pub const RTT: usize = 68;
    pub const RTTVAR: usize = 72;
    pub const SND_SSTHRESH: usize = 76;
    pub const SND_CWND: usize = 80;
    pub const ADVMSS: usize = 84;
    pub const REORDERING: usize = 88;
    pub const RCV_RTT: usize = 92;
    pub const RCV_SPACE: usize = 96;
    pub const TOTAL_RETRANS: usize = 100;
}

mod vegas_info_offsets {
    pub const ENABLED: usize = 0;
    pub const RTT: usize = 8;
}

/// Applies `TCP_INFO`/`VEGASINFO` payloads onto a [`TcpStat`], following
/// the sentinel-suppression rules: RTO, cwnd, and ssthresh become `None`
/// rather than their literal wire value when the kernel's own "not yet
/// sampled" constants are seen.
fn apply_tcp_info(stat: &mut TcpStat, tcp_info: &[u8], vegas_info: Option<&[u8]>) {
    use tcp_info_offsets as o;

    stat.options = u8_at(tcp_info, o::OPTIONS);
    stat.retransmits = u8_at(tcp_info, o::RETRANSMITS);
    stat.probes = u8_at(tcp_info, o::PROBES);
    stat.backoff = u8_at(tcp_info, o::BACKOFF);

    let wscale_byte = u8_at(tcp_info, o::WSCALE);
    if stat.options & TCPI_OPT_WSCALE != 0 {
        stat.snd_wnd_scale = Some(wscale_byte & 0x0F);
        stat.rcv_wnd_scale = Some((wscale_byte >> 4) & 0x0F);
    }

    stat.snd_mss = u32_at(tcp_info, o::SND_MSS);
    stat.rcv_mss = u32_at(tcp_info, o::RCV_MSS);

    let rto = u32_at(tcp_info, o::RTO);
    stat.retransmit_timeout = if rto == 0 || rto == RTO_UNSET_USECS { None } else { Some(rto) };
    stat.acknowledge_timeout = u32_at(tcp_info, o::ATO);

    let mut rtt = u32_at(tcp_info, o::RTT);
    if let Some(vegas) = vegas_info {
        let enabled = u32_at(vegas, vegas_info_offsets::ENABLED);
        let vegas_rtt = u32_at(vegas, vegas_info_offsets::RTT);
        if enabled != 0 && vegas_rtt != 0 && vegas_rtt != VEGAS_RTT_UNSET {
            rtt = vegas_rtt;
        }
    }
    stat.round_trip_time = rtt;
    stat.round_trip_time_var = u32_at(tcp_info, o::RTTVAR);
    stat.total_retrans = u32_at(tcp_info, o::TOTAL_RETRANS);

    let cwnd = u32_at(tcp_info, o::SND_CWND);
    stat.snd_cwnd = if cwnd == CWND_UNSET { None } else { Some(cwnd) };

    let ssthresh = u32_at(tcp_info, o::SND_SSTHRESH);
    stat.snd_ssthresh = if ssthresh >= SSTHRESH_UNSET_FLOOR { None } else { Some(ssthresh) };

    // Bandwidth is derived from the raw cwnd, not the sentinel-suppressed
    // `stat.snd_cwnd` — a cwnd of 2 (unconfirmed) still yields an estimate.
    stat.snd_bandwidth = if cwnd > 0 && stat.round_trip_time > 0 && stat.snd_mss > 0 {
        Some((cwnd as f64 * stat.snd_mss as f64 * 8_000_000.0) / stat.round_trip_time as f64)
    } else {
        None
    };

    stat.rcv_rrt = u32_at(tcp_info, o::RCV_RTT);
    stat.rcv_space = u32_at(tcp_info, o::RCV_SPACE);

    let _ = (o::STATE, o::PMTU, o::RCV_SSTHRESH, o::ADVMSS, o::REORDERING, o::CA_STATE);
}

/// Walks `msg`'s SKMEMINFO payload (7 `u32` words: rmem_alloc, rcvbuf,
/// wmem_alloc, sndbuf, fwd_alloc, wmem_queued, optmem) into the generic
/// queue/buffer fields. A short payload (older kernel without the
/// trailing backlog word) leaves `backlog_packets` at zero.
fn apply_skmeminfo(stat: &mut InetSockStat, skmeminfo: &[u8]) {
    stat.rcv_queue_mem = u32_at(skmeminfo, 0);
    stat.rcv_sock_buf = u32_at(skmeminfo, 4);
    stat.snd_queue_mem = u32_at(skmeminfo, 8);
    stat.snd_sock_buf = u32_at(skmeminfo, 12);
    stat.tcp_fwd_alloc = u32_at(skmeminfo, 16);
    stat.tcp_queued_mem = u32_at(skmeminfo, 20);
    if skmeminfo.len() >= 32 {
        stat.backlog_packets = u32_at(skmeminfo, 28);
    }
}

/// Whether to keep a message that only-current-user/only-current-process
/// filtering would otherwise drop. Resolution failures (no matching pid)
/// drop the socket rather than keeping it with `pid: None`, mirroring the
/// original's "skip sockets we cannot attribute to the running user."
fn passes_identity_filter(
    pid: Option<i32>,
    uid: u32,
    only_current_user: bool,
    only_current_process: bool,
) -> bool {
    if only_current_process && pid != Some(std::process::id() as i32) {
        return false;
    }
    if only_current_user {
        let current_uid = nix::unistd::Uid::current().as_raw();
        if uid != current_uid {
            return false;
        }
    }
    true
}

fn username_for(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// Decodes one `inet_diag_msg`, returning `None` if identity filtering
/// rejects it.
pub(crate) fn decode_message(
    msg: DiagMessage<'_>,
    family: AddressFamily,
    inodes: &InodeIndex,
    only_current_user: bool,
    only_current_process: bool,
) -> Option<(InetSockStat, TcpStat)> {
    let expected_family = match family {
        AddressFamily::V4 => libc::AF_INET as u8,
        AddressFamily::V6 => libc::AF_INET6 as u8,
    };
    if msg.family != expected_family {
        // AF_UNSPEC (or any family other than the one this dump was
        // requested for) is dropped rather than guessed at.
        return None;
    }

    let pid = inodes.lookup(msg.inode).map(|e| e.pid);

    if !passes_identity_filter(pid, msg.uid, only_current_user, only_current_process) {
        return None;
    }

    let state = SocketState::from_raw(msg.state);
    let local_address = addr_from_words(msg.src, family).to_string();
    let remote_address = addr_from_words(msg.dst, family).to_string();

    let mut inet_stat = InetSockStat {
        local_address,
        remote_address,
        local_port: msg.sport,
        remote_port: msg.dport,
        family,
        conn_state: msg.state,
        state_name: state.name(),
        pid,
        uid: msg.uid,
        username: username_for(msg.uid),
        // Same two kernel fields for every state; LISTEN reports
        // pending-connections/backlog-length, anything else reports
        // incoming-data/send-available bytes (spec §3).
        request_queue: msg.rqueue,
        waiting_queue: msg.wqueue,
        rcv_queue_mem: 0,
        snd_queue_mem: 0,
        rcv_sock_buf: 0,
        snd_sock_buf: 0,
        tcp_fwd_alloc: 0,
        tcp_queued_mem: 0,
        backlog_packets: 0,
    };

    let mut tcp_stat = TcpStat::new();
    tcp_stat.timer = msg.timer;
    tcp_stat.timer_name = TimerState::from_raw(msg.timer).name();
    tcp_stat.timer_retransmits = msg.retrans;
    tcp_stat.timer_timeout = msg.expires;

    let mut tcp_info: Option<&[u8]> = None;
    let mut vegas_info: Option<&[u8]> = None;

    for Attr { attr_type, payload } in netlink::iter_attrs(msg.attrs) {
        match attr_type {
            netlink::ATTR_SKMEMINFO => apply_skmeminfo(&mut inet_stat, payload),
            netlink::ATTR_INFO => tcp_info = Some(payload),
            netlink::ATTR_VEGASINFO => vegas_info = Some(payload),
            _ => {}
        }
    }

    if let Some(tcp_info) = tcp_info {
        apply_tcp_info(&mut tcp_stat, tcp_info, vegas_info);
    }

    Some((inet_stat, tcp_stat))
}
