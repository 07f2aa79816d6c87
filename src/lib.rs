//! In-process Linux TCP/UDP socket diagnostics via `NETLINK_INET_DIAG` —
//! `ss(8)`-grade telemetry without forking a subprocess. See `SPEC_FULL.md`
//! for the full component breakdown.

mod collector;
mod decode;
mod filter;
mod inode_index;
mod netlink;
mod types;

pub use collector::collect_sock_stat;
pub use types::{
    AddressFamily, InetSockStat, PidEntry, PortFilterExpr, Protocol, Side, SockFilter,
    SocketState, TcpStat, TimerState,
};
