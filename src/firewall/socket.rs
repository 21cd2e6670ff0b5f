//! Raw kernel socket for packet-filter table access
//!
//! The mirror talks to the kernel through three socket options on a raw
//! IPv4 socket: table info, the current entry blob, and the atomic replace.
//! The seam is a trait so the engine can be driven against an in-memory
//! kernel in tests.

use super::entry::NUM_HOOKS;
use crate::error::{ConnError, ConnResult};
use std::io;

const IPT_SO_SET_REPLACE: libc::c_int = 64;
const IPT_SO_GET_INFO: libc::c_int = 64;
const IPT_SO_GET_ENTRIES: libc::c_int = 65;

const GETINFO_SIZE: usize = 84;
const GET_ENTRIES_HEADER: usize = 40;
const REPLACE_HEADER: usize = 96;
const COUNTER_SIZE: usize = 16;

/// Kernel-reported shape of a table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub valid_hooks: u32,
    pub hook_entry: [u32; NUM_HOOKS],
    pub underflow: [u32; NUM_HOOKS],
    pub num_entries: u32,
    pub size: u32,
}

/// Serialized replacement for a whole table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceBlob {
    pub name: String,
    pub valid_hooks: u32,
    pub num_entries: u32,
    pub size: u32,
    pub hook_entry: [u32; NUM_HOOKS],
    pub underflow: [u32; NUM_HOOKS],
    pub num_counters: u32,
    pub entries: Vec<u8>,
}

pub trait NetfilterSocket: Send + Sync {
    fn info(&self, table: &str) -> ConnResult<TableInfo>;
    fn entries(&self, table: &str, size: usize) -> ConnResult<Vec<u8>>;
    fn replace(&self, blob: &ReplaceBlob) -> ConnResult<()>;
}

/// The real kernel boundary.
pub struct RawNetfilterSocket {
    fd: libc::c_int,
}

impl RawNetfilterSocket {
    pub fn new() -> ConnResult<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_RAW,
            )
        };
        if fd < 0 {
            return Err(ConnError::Io(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }
}

impl Drop for RawNetfilterSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn write_name(buf: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(31);
    buf[..len].copy_from_slice(&bytes[..len]);
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_hooks(buf: &[u8], off: usize) -> [u32; NUM_HOOKS] {
    let mut hooks = [0u32; NUM_HOOKS];
    for (i, hook) in hooks.iter_mut().enumerate() {
        *hook = read_u32(buf, off + i * 4);
    }
    hooks
}

impl NetfilterSocket for RawNetfilterSocket {
    fn info(&self, table: &str) -> ConnResult<TableInfo> {
        let mut buf = [0u8; GETINFO_SIZE];
        write_name(&mut buf, table);

        let mut len = GETINFO_SIZE as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_IP,
                IPT_SO_GET_INFO,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(ConnError::Io(io::Error::last_os_error()));
        }

        Ok(TableInfo {
            name: table.to_string(),
            valid_hooks: read_u32(&buf, 32),
            hook_entry: read_hooks(&buf, 36),
            underflow: read_hooks(&buf, 56),
            num_entries: read_u32(&buf, 76),
            size: read_u32(&buf, 80),
        })
    }

    fn entries(&self, table: &str, size: usize) -> ConnResult<Vec<u8>> {
        let mut buf = vec![0u8; GET_ENTRIES_HEADER + size];
        write_name(&mut buf, table);
        buf[32..36].copy_from_slice(&(size as u32).to_ne_bytes());

        let mut len = buf.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_IP,
                IPT_SO_GET_ENTRIES,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(ConnError::Io(io::Error::last_os_error()));
        }

        buf.drain(..GET_ENTRIES_HEADER);
        buf.truncate(size);
        Ok(buf)
    }

    fn replace(&self, blob: &ReplaceBlob) -> ConnResult<()> {
        // The kernel writes the old counters through the embedded pointer;
        // it must reference writable memory for the whole call.
        let mut counters = vec![0u8; blob.num_counters as usize * COUNTER_SIZE];

        let mut buf = vec![0u8; REPLACE_HEADER + blob.entries.len()];
        write_name(&mut buf, &blob.name);
        buf[32..36].copy_from_slice(&blob.valid_hooks.to_ne_bytes());
        buf[36..40].copy_from_slice(&blob.num_entries.to_ne_bytes());
        buf[40..44].copy_from_slice(&blob.size.to_ne_bytes());
        for (i, hook) in blob.hook_entry.iter().enumerate() {
            buf[44 + i * 4..48 + i * 4].copy_from_slice(&hook.to_ne_bytes());
        }
        for (i, hook) in blob.underflow.iter().enumerate() {
            buf[64 + i * 4..68 + i * 4].copy_from_slice(&hook.to_ne_bytes());
        }
        buf[84..88].copy_from_slice(&blob.num_counters.to_ne_bytes());
        buf[88..96].copy_from_slice(&(counters.as_mut_ptr() as u64).to_ne_bytes());
        buf[REPLACE_HEADER..].copy_from_slice(&blob.entries);

        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_IP,
                IPT_SO_SET_REPLACE,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(ConnError::Rejected {
                op: format!("replace table {}", blob.name),
                errno: err.raw_os_error().unwrap_or(0),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::entry::{IpSelector, Rule, Target, VERDICT_ACCEPT};
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn policy_entry() -> Rule {
        Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Standard {
                verdict: VERDICT_ACCEPT,
            },
        )
    }

    fn terminal_entry() -> Rule {
        Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Error {
                chain: "ERROR".to_string(),
            },
        )
    }

    fn build_fixture(name: &str, hooks: &[usize]) -> (TableInfo, Vec<u8>) {
        let mut blob = Vec::new();
        let mut hook_entry = [0u32; NUM_HOOKS];
        let mut underflow = [0u32; NUM_HOOKS];
        let mut valid_hooks = 0u32;

        for &hook in hooks {
            let offset = blob.len() as u32;
            valid_hooks |= 1 << hook;
            hook_entry[hook] = offset;
            underflow[hook] = offset;
            policy_entry().serialize(&mut blob);
        }
        terminal_entry().serialize(&mut blob);

        let info = TableInfo {
            name: name.to_string(),
            valid_hooks,
            hook_entry,
            underflow,
            num_entries: hooks.len() as u32 + 1,
            size: blob.len() as u32,
        };
        (info, blob)
    }

    /// Pristine `filter` table: INPUT/FORWARD/OUTPUT policies + terminator.
    pub(crate) fn filter_fixture() -> (TableInfo, Vec<u8>) {
        build_fixture("filter", &[1, 2, 3])
    }

    /// Pristine `nat` table: PREROUTING/OUTPUT/POSTROUTING.
    pub(crate) fn nat_fixture() -> (TableInfo, Vec<u8>) {
        build_fixture("nat", &[0, 3, 4])
    }

    /// In-memory kernel standing in for the raw socket.
    pub(crate) struct FakeNetfilter {
        tables: HashMap<String, (TableInfo, Vec<u8>)>,
        pub committed: Mutex<Vec<ReplaceBlob>>,
        pub fail_replace: bool,
    }

    impl FakeNetfilter {
        pub fn new() -> Self {
            let mut tables = HashMap::new();
            let filter = filter_fixture();
            let nat = nat_fixture();
            tables.insert("filter".to_string(), filter);
            tables.insert("nat".to_string(), nat);
            Self {
                tables,
                committed: Mutex::new(Vec::new()),
                fail_replace: false,
            }
        }
    }

    impl NetfilterSocket for FakeNetfilter {
        fn info(&self, table: &str) -> ConnResult<TableInfo> {
            self.tables
                .get(table)
                .map(|(info, _)| info.clone())
                .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))
        }

        fn entries(&self, table: &str, _size: usize) -> ConnResult<Vec<u8>> {
            self.tables
                .get(table)
                .map(|(_, blob)| blob.clone())
                .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))
        }

        fn replace(&self, blob: &ReplaceBlob) -> ConnResult<()> {
            if self.fail_replace {
                return Err(ConnError::Rejected {
                    op: format!("replace table {}", blob.name),
                    errno: libc::EPERM,
                });
            }
            self.committed.lock().unwrap().push(blob.clone());
            Ok(())
        }
    }

    #[test]
    fn test_fixture_shape() {
        let (info, blob) = filter_fixture();
        assert_eq!(info.valid_hooks, 0x0e);
        assert_eq!(info.hook_entry[1], 0);
        assert_eq!(info.hook_entry[2], 152);
        assert_eq!(info.hook_entry[3], 304);
        assert_eq!(blob.len(), 632);
    }
}
