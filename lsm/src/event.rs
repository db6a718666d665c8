//! Decoders for the fixed-layout records the kernel backend's ring buffers
//! emit. Every record is little-endian with a NUL-padded fixed-size byte
//! buffer for any string field, matching the layout the eBPF side writes
//! with `bpf_probe_read`.

use leash_policy::ir::MAX_ARGS;
use leash_policy::ir::MAX_ARG_LEN;
use leash_policy::ir::MAX_PATH_LEN;

use crate::error::LsmError;

const PATH_BUF_LEN: usize = MAX_PATH_LEN + 1;
const ARG_BUF_LEN: usize = MAX_ARG_LEN + 1;

fn read_u32(buf: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*off..*off + 4].try_into().expect("checked length"));
    *off += 4;
    v
}

fn read_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*off..*off + 8].try_into().expect("checked length"));
    *off += 8;
    v
}

fn read_i32(buf: &[u8], off: &mut usize) -> i32 {
    let v = i32::from_le_bytes(buf[*off..*off + 4].try_into().expect("checked length"));
    *off += 4;
    v
}

fn read_u16(buf: &[u8], off: &mut usize) -> u16 {
    let v = u16::from_le_bytes(buf[*off..*off + 2].try_into().expect("checked length"));
    *off += 2;
    v
}

fn read_cstr(buf: &[u8], off: &mut usize, width: usize) -> String {
    let raw = &buf[*off..*off + width];
    *off += width;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    pub pid: u32,
    pub tgid: u32,
    pub uid: u32,
    pub cgroup_id: u64,
    pub timestamp_ns: u64,
    pub flags: u32,
    pub ret: i32,
    pub path: String,
}

const OPEN_EVENT_LEN: usize = 4 + 4 + 4 + 8 + 8 + 4 + 4 + PATH_BUF_LEN;

impl OpenEvent {
    pub fn decode(buf: &[u8]) -> Result<Self, LsmError> {
        if buf.len() < OPEN_EVENT_LEN {
            return Err(LsmError::MalformedEvent("open event shorter than expected record length"));
        }
        let mut off = 0;
        Ok(Self {
            pid: read_u32(buf, &mut off),
            tgid: read_u32(buf, &mut off),
            uid: read_u32(buf, &mut off),
            cgroup_id: read_u64(buf, &mut off),
            timestamp_ns: read_u64(buf, &mut off),
            flags: read_u32(buf, &mut off),
            ret: read_i32(buf, &mut off),
            path: read_cstr(buf, &mut off, PATH_BUF_LEN),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: u32,
    pub tgid: u32,
    pub uid: u32,
    pub cgroup_id: u64,
    pub timestamp_ns: u64,
    pub ret: i32,
    pub path: String,
    pub argv: Vec<String>,
}

const EXEC_EVENT_LEN: usize = 4 + 4 + 4 + 8 + 8 + 4 + PATH_BUF_LEN + MAX_ARGS * ARG_BUF_LEN;

impl ExecEvent {
    pub fn decode(buf: &[u8]) -> Result<Self, LsmError> {
        if buf.len() < EXEC_EVENT_LEN {
            return Err(LsmError::MalformedEvent("exec event shorter than expected record length"));
        }
        let mut off = 0;
        let pid = read_u32(buf, &mut off);
        let tgid = read_u32(buf, &mut off);
        let uid = read_u32(buf, &mut off);
        let cgroup_id = read_u64(buf, &mut off);
        let timestamp_ns = read_u64(buf, &mut off);
        let ret = read_i32(buf, &mut off);
        let path = read_cstr(buf, &mut off, PATH_BUF_LEN);
        let mut argv = Vec::with_capacity(MAX_ARGS);
        for _ in 0..MAX_ARGS {
            let arg = read_cstr(buf, &mut off, ARG_BUF_LEN);
            if !arg.is_empty() {
                argv.push(arg);
            }
        }
        Ok(Self { pid, tgid, uid, cgroup_id, timestamp_ns, ret, path, argv })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectEvent {
    pub pid: u32,
    pub tgid: u32,
    pub uid: u32,
    pub cgroup_id: u64,
    pub timestamp_ns: u64,
    pub dest_ip4: u32,
    pub dest_port: u16,
    pub ret: i32,
}

const CONNECT_EVENT_LEN: usize = 4 + 4 + 4 + 8 + 8 + 4 + 2 + 4;

impl ConnectEvent {
    pub fn decode(buf: &[u8]) -> Result<Self, LsmError> {
        if buf.len() < CONNECT_EVENT_LEN {
            return Err(LsmError::MalformedEvent("connect event shorter than expected record length"));
        }
        let mut off = 0;
        Ok(Self {
            pid: read_u32(buf, &mut off),
            tgid: read_u32(buf, &mut off),
            uid: read_u32(buf, &mut off),
            cgroup_id: read_u64(buf, &mut off),
            timestamp_ns: read_u64(buf, &mut off),
            dest_ip4: read_u32(buf, &mut off),
            dest_port: read_u16(buf, &mut off),
            ret: read_i32(buf, &mut off),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn push_str_buf(buf: &mut Vec<u8>, s: &str, width: usize) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(width, 0);
        buf.extend_from_slice(&bytes);
    }

    #[test]
    fn decodes_open_event() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&1000u32.to_le_bytes());
        buf.extend_from_slice(&55u64.to_le_bytes());
        buf.extend_from_slice(&9_000_000u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        push_str_buf(&mut buf, "/etc/passwd", PATH_BUF_LEN);

        let event = OpenEvent::decode(&buf).unwrap();
        assert_eq!(event.pid, 100);
        assert_eq!(event.cgroup_id, 55);
        assert_eq!(event.path, "/etc/passwd");
    }

    #[test]
    fn decodes_exec_event_with_argv() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&7u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        push_str_buf(&mut buf, "/bin/ls", PATH_BUF_LEN);
        push_str_buf(&mut buf, "-la", ARG_BUF_LEN);
        push_str_buf(&mut buf, "", ARG_BUF_LEN);
        push_str_buf(&mut buf, "", ARG_BUF_LEN);

        let event = ExecEvent::decode(&buf).unwrap();
        assert_eq!(event.path, "/bin/ls");
        assert_eq!(event.argv, vec!["-la".to_string()]);
    }

    #[test]
    fn rejects_truncated_buffer() {
        let err = OpenEvent::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, LsmError::MalformedEvent(_)));
    }
}
