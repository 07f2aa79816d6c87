//! Netlink client (C3): opens a `NETLINK_INET_DIAG` socket, issues
//! `SOCK_DIAG_BY_FAMILY` dump requests, and streams the multi-part
//! response. Wire layout and retry semantics mirror
//! `examples/original_source/src/main/c/sock_probe.c`'s `send_diag_msg`/
//! `recv_diag_msg`. See spec §4.3.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::types::{AddressFamily, Protocol, SocketState};

// -- netlink framing constants (kept local rather than assumed present in
// `libc`, the same defensive choice the netlink examples in the
// retrieval pack make) --

const NLMSG_ALIGNTO: usize = 4;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ROOT: u16 = 0x100;
const NLM_F_MATCH: u16 = 0x200;
const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NETLINK_INET_DIAG: libc::c_int = 4;
const SOCK_DIAG_BY_FAMILY: u16 = 20;

const INET_DIAG_REQ_BYTECODE: u16 = 1;

pub(crate) const ATTR_MEMINFO: u16 = 1;
pub(crate) const ATTR_INFO: u16 = 2;
pub(crate) const ATTR_VEGASINFO: u16 = 3;
pub(crate) const ATTR_CONG: u16 = 4;
pub(crate) const ATTR_SKMEMINFO: u16 = 7;

fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct InetDiagSockId {
    idiag_sport: u16,
    idiag_dport: u16,
    idiag_src: [u32; 4],
    idiag_dst: [u32; 4],
    idiag_if: u32,
    idiag_cookie: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct InetDiagReqV2 {
    sdiag_family: u8,
    sdiag_protocol: u8,
    idiag_ext: u8,
    pad: u8,
    idiag_states: u32,
    id: InetDiagSockId,
}

/// A decoded `inet_diag_msg` header plus the raw trailing rtattr bytes;
/// handed to [`crate::decode::decode_message`].
pub(crate) struct DiagMessage<'a> {
    pub family: u8,
    pub state: u8,
    pub timer: u8,
    pub retrans: u8,
    pub sport: u16,
    pub dport: u16,
    pub src: [u32; 4],
    pub dst: [u32; 4],
    pub expires: u32,
    pub rqueue: u32,
    pub wqueue: u32,
    pub uid: u32,
    pub inode: u32,
    pub attrs: &'a [u8],
}

// family,state,timer,retrans(4) + sport,dport(4) + src(16) + dst(16)
// + if(4) + cookie(8) + expires,rqueue,wqueue,uid,inode(20) = 72 bytes.
#[cfg(test)]
const INET_DIAG_MSG_LEN: usize = 4 + 4 + 16 + 16 + 4 + 8 + 4 * 5;

fn parse_diag_msg(buf: &[u8]) -> Option<DiagMessage<'_>> {
    // struct inet_diag_msg {
    //   u8 idiag_family, idiag_state, idiag_timer, idiag_retrans;
    //   struct inet_diag_sockid id; // sport(2) dport(2) src[4] dst[4] if(4) cookie[2]
    //   u32 idiag_expires, idiag_rqueue, idiag_wqueue, idiag_uid, idiag_inode;
    // }
    const SOCKID_LEN: usize = 2 + 2 + 16 + 16 + 4 + 8;
    const HDR_LEN: usize = 4 + SOCKID_LEN + 4 * 5;
    if buf.len() < HDR_LEN {
        return None;
    }

    let family = buf[0];
    let state = buf[1];
    let timer = buf[2];
    let retrans = buf[3];

    let mut off = 4;
    let sport = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;
    let dport = u16::from_be_bytes([buf[off], buf[off + 1]]);
    off += 2;

    let mut src = [0u32; 4];
    for word in &mut src {
        *word = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
    }
    let mut dst = [0u32; 4];
    for word in &mut dst {
        *word = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
    }
    off += 4; // idiag_if
    off += 8; // idiag_cookie

    let expires = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let rqueue = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let wqueue = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let uid = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;
    let inode = u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap());
    off += 4;

    Some(DiagMessage {
        family,
        state,
        timer,
        retrans,
        sport,
        dport,
        src,
        dst,
        expires,
        rqueue,
        wqueue,
        uid,
        inode,
        attrs: &buf[off..],
    })
}

/// One attribute from the trailing rtattr chain: `(type, payload)`.
pub(crate) struct Attr<'a> {
    pub attr_type: u16,
    pub payload: &'a [u8],
}

/// Walks an rtattr chain, yielding each attribute's type and payload.
/// Malformed trailing bytes (shorter than a header, or a length that
/// overruns the buffer) simply end iteration rather than erroring —
/// unknown/malformed attributes are silently ignored per spec §7.
pub(crate) fn iter_attrs(mut buf: &[u8]) -> impl Iterator<Item = Attr<'_>> {
    std::iter::from_fn(move || {
        const RTA_HDR_LEN: usize = 4;
        if buf.len() < RTA_HDR_LEN {
            return None;
        }
        let rta_len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let rta_type = u16::from_ne_bytes([buf[2], buf[3]]);
        if rta_len < RTA_HDR_LEN || rta_len > buf.len() {
            return None;
        }

        let payload = &buf[RTA_HDR_LEN..rta_len];
        let advance = nlmsg_align(rta_len).min(buf.len());
        buf = &buf[advance..];

        Some(Attr { attr_type: rta_type, payload })
    })
}

/// An open `AF_NETLINK`/`NETLINK_INET_DIAG` datagram socket, closed on
/// drop.
pub(crate) struct NetlinkDiagSocket {
    fd: RawFd,
}

impl NetlinkDiagSocket {
    pub fn open() -> eyre::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_DGRAM, NETLINK_INET_DIAG) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).map_err(|e| {
                eyre::eyre!("could not open AF_NETLINK/NETLINK_INET_DIAG socket: {e}")
            });
        }
        Ok(Self { fd })
    }

    /// Sends a `SOCK_DIAG_BY_FAMILY` dump request for `(family, protocol)`,
    /// with the states mask fixed to exclude `SYN_RECV`/`TIME_WAIT`/
    /// `CLOSE` and the extension mask covering MEMINFO/SKMEMINFO/INFO/
    /// VEGASINFO/CONG, optionally carrying a compiled port-filter bytecode
    /// blob as `INET_DIAG_REQ_BYTECODE`.
    pub fn send_dump_request(
        &self,
        family: AddressFamily,
        protocol: Protocol,
        bytecode: Option<&[u8]>,
    ) -> eyre::Result<()> {
        const TCPF_ALL: u32 = 0xFFF;
        let excluded = (1u32 << SocketState::SynRecv as u32)
            | (1u32 << SocketState::TimeWait as u32)
            | (1u32 << SocketState::Close as u32);
        let idiag_states = TCPF_ALL & !excluded;

        // MEMINFO=1, INFO=2, VEGASINFO=3, CONG=4, SKMEMINFO=7, each bit
        // (id - 1).
        let idiag_ext: u8 = (1 << (ATTR_MEMINFO - 1))
            | (1 << (ATTR_INFO - 1))
            | (1 << (ATTR_VEGASINFO - 1))
            | (1 << (ATTR_CONG - 1))
            | (1 << (ATTR_SKMEMINFO - 1));

        let sdiag_family = match family {
            AddressFamily::V4 => libc::AF_INET as u8,
            AddressFamily::V6 => libc::AF_INET6 as u8,
        };

        let req = InetDiagReqV2 {
            sdiag_family,
            sdiag_protocol: protocol.ipproto() as u8,
            idiag_ext,
            pad: 0,
            idiag_states,
            id: InetDiagSockId::default(),
        };

        let req_bytes =
            unsafe { std::slice::from_raw_parts(&req as *const _ as *const u8, mem::size_of::<InetDiagReqV2>()) };

        let mut msg_len = mem::size_of::<NlMsgHdr>() + req_bytes.len();

        let mut rta_header = [0u8; 4];
        let aligned_bc_len = bytecode.map(|bc| nlmsg_align(4 + bc.len())).unwrap_or(0);
        if let Some(bc) = bytecode {
            let rta_len = (4 + bc.len()) as u16;
            rta_header[0..2].copy_from_slice(&rta_len.to_ne_bytes());
            rta_header[2..4].copy_from_slice(&INET_DIAG_REQ_BYTECODE.to_ne_bytes());
            msg_len += aligned_bc_len;
        }

        let header = NlMsgHdr {
            nlmsg_len: msg_len as u32,
            nlmsg_type: SOCK_DIAG_BY_FAMILY,
            nlmsg_flags: NLM_F_DUMP | NLM_F_REQUEST,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };
        let header_bytes =
            unsafe { std::slice::from_raw_parts(&header as *const _ as *const u8, mem::size_of::<NlMsgHdr>()) };

        let mut iov = vec![
            libc::iovec { iov_base: header_bytes.as_ptr() as *mut _, iov_len: header_bytes.len() },
            libc::iovec { iov_base: req_bytes.as_ptr() as *mut _, iov_len: req_bytes.len() },
        ];

        let pad = [0u8; NLMSG_ALIGNTO];
        let bc_pad_len = bytecode.map(|bc| aligned_bc_len - (4 + bc.len())).unwrap_or(0);
        if let Some(bc) = bytecode {
            iov.push(libc::iovec { iov_base: rta_header.as_ptr() as *mut _, iov_len: rta_header.len() });
            iov.push(libc::iovec { iov_base: bc.as_ptr() as *mut _, iov_len: bc.len() });
            if bc_pad_len > 0 {
                iov.push(libc::iovec { iov_base: pad.as_ptr() as *mut _, iov_len: bc_pad_len });
            }
        }

        let mut dest: libc::sockaddr_nl = unsafe { mem::zeroed() };
        dest.nl_family = libc::AF_NETLINK as u16;

        let msghdr = libc::msghdr {
            msg_name: &mut dest as *mut _ as *mut libc::c_void,
            msg_namelen: mem::size_of::<libc::sockaddr_nl>() as u32,
            msg_iov: iov.as_mut_ptr(),
            msg_iovlen: iov.len(),
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        let sent = unsafe { libc::sendmsg(self.fd, &msghdr, 0) };
        if sent < 0 {
            return Err(eyre::eyre!(
                "sendmsg on netlink socket failed: {}",
                io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    /// Reads replies until `NLMSG_DONE`, handing each message's
    /// `inet_diag_msg` payload to `on_message`. Returns `Ok(false)` if the
    /// kernel replied `EOPNOTSUPP` (older kernel, caller should stop the
    /// whole collection); `Ok(true)` on a clean `NLMSG_DONE`/EOF.
    pub fn recv_dump_reply(
        &self,
        mut on_message: impl FnMut(DiagMessage<'_>),
    ) -> eyre::Result<bool> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let buf_len = page_size.min(8192);
        let mut buf = vec![0u8; buf_len];

        'recv: loop {
            let n = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue 'recv;
                }
                tracing::warn!(%err, "OVERRUN");
                continue 'recv;
            }
            if n == 0 {
                tracing::debug!("EOF on netlink");
                return Ok(true);
            }

            let mut remaining = &buf[..n as usize];
            loop {
                const NLMSG_HDR_LEN: usize = 16;
                if remaining.len() < NLMSG_HDR_LEN {
                    break;
                }

                let nlmsg_len =
                    u32::from_ne_bytes(remaining[0..4].try_into().unwrap()) as usize;
                let nlmsg_type =
                    u16::from_ne_bytes(remaining[4..6].try_into().unwrap());

                if nlmsg_len < NLMSG_HDR_LEN || nlmsg_len > remaining.len() {
                    break;
                }

                if nlmsg_type == NLMSG_DONE {
                    return Ok(true);
                }

                if nlmsg_type == NLMSG_ERROR {
                    const NLMSGERR_LEN: usize = NLMSG_HDR_LEN + 4;
                    if nlmsg_len < NLMSGERR_LEN {
                        tracing::warn!("ERROR truncated");
                        return Ok(true);
                    }
                    let error =
                        i32::from_ne_bytes(remaining[16..20].try_into().unwrap());
                    if error == 0 {
                        // an ack, not an error; treat like any other message
                    } else if -error == libc::EOPNOTSUPP {
                        return Ok(false);
                    } else {
                        tracing::warn!(
                            error = -error,
                            "netlink dump returned an error"
                        );
                        return Ok(true);
                    }
                } else {
                    let payload = &remaining[NLMSG_HDR_LEN..nlmsg_len];
                    if let Some(msg) = parse_diag_msg(payload) {
                        on_message(msg);
                    }
                }

                let advance = nlmsg_align(nlmsg_len);
                if advance == 0 || advance > remaining.len() {
                    break;
                }
                remaining = &remaining[advance..];
            }
        }
    }
}

impl Drop for NetlinkDiagSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_attrs_walks_rtattr_chain() {
        // two attrs: type=7 payload=[1,2,3,4], type=2 payload=[9,9]
        let mut buf = Vec::new();
        let push_attr = |buf: &mut Vec<u8>, ty: u16, payload: &[u8]| {
            let len = (4 + payload.len()) as u16;
            buf.extend(len.to_ne_bytes());
            buf.extend(ty.to_ne_bytes());
            buf.extend(payload);
            while buf.len() % NLMSG_ALIGNTO != 0 {
                buf.push(0);
            }
        };
        push_attr(&mut buf, 7, &[1, 2, 3, 4]);
        push_attr(&mut buf, 2, &[9, 9]);

        let attrs: Vec<_> = iter_attrs(&buf).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].attr_type, 7);
        assert_eq!(attrs[0].payload, &[1, 2, 3, 4]);
        assert_eq!(attrs[1].attr_type, 2);
        assert_eq!(attrs[1].payload, &[9, 9]);
    }

    #[test]
    fn malformed_attr_stops_iteration_without_panicking() {
        let buf = vec![0xFF, 0xFF, 0, 0]; // rta_len way past buffer
        let attrs: Vec<_> = iter_attrs(&buf).collect();
        assert!(attrs.is_empty());
    }

    #[test]
    fn parse_diag_msg_reads_family_and_inode() {
        let mut buf = vec![0u8; INET_DIAG_MSG_LEN];
        buf[0] = libc::AF_INET as u8; // family
        buf[1] = 1; // ESTABLISHED
        // inode is the last 4 bytes
        let inode: u32 = 99999;
        let len = buf.len();
        buf[len - 4..].copy_from_slice(&inode.to_ne_bytes());

        let msg = parse_diag_msg(&buf).unwrap();
        assert_eq!(msg.family, libc::AF_INET as u8);
        assert_eq!(msg.state, 1);
        assert_eq!(msg.inode, 99999);
    }
}
