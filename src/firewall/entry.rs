//! Kernel-layout records for the packet-filter mirror
//!
//! Rules are variable-length records in the exact byte layout the kernel's
//! table-replace call expects: a fixed entry header carrying the IPv4
//! selector, zero or more match blocks, then one target block. All blocks
//! are 8-byte aligned and sized by their embedded length fields.

use std::net::Ipv4Addr;

/// Entry alignment in the serialized table blob.
pub const BLOB_ALIGN: usize = 8;

/// Fixed entry header size (selector + offsets + counters).
pub const ENTRY_HEADER_SIZE: usize = 112;

/// Serialized size of the IPv4 selector.
pub const IP_SELECTOR_SIZE: usize = 84;

/// Match/target block header size (length + name + revision).
pub const EXT_HEADER_SIZE: usize = 32;

/// Extension name field width (trailing NUL included).
pub const EXT_NAME_LEN: usize = 29;

/// Standard target block size (header + verdict, aligned).
pub const STANDARD_TARGET_SIZE: usize = 40;

/// Error target block size (header + chain name).
pub const ERROR_TARGET_SIZE: usize = 64;

/// Chain/table name field width.
pub const TABLE_NAME_LEN: usize = 32;

/// Interface name field width.
pub const IFACE_NAME_LEN: usize = 16;

pub const ERROR_TARGET_NAME: &str = "ERROR";

/// Number of kernel hooks a table can attach to.
pub const NUM_HOOKS: usize = 5;

pub const HOOK_NAMES: [&str; NUM_HOOKS] =
    ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

// Standard-target verdicts: negative values encode built-in dispositions,
// non-negative values are jump offsets into the blob.
pub const VERDICT_DROP: i32 = -1;
pub const VERDICT_ACCEPT: i32 = -2;
pub const VERDICT_QUEUE: i32 = -4;
pub const VERDICT_RETURN: i32 = -5;
pub const VERDICT_STOP: i32 = -6;

// Selector invert flags.
pub const INV_VIA_IN: u8 = 0x01;
pub const INV_VIA_OUT: u8 = 0x02;
pub const INV_SRC: u8 = 0x08;
pub const INV_DST: u8 = 0x10;

pub fn blob_align(size: usize) -> usize {
    (size + BLOB_ALIGN - 1) & !(BLOB_ALIGN - 1)
}

pub fn verdict_for(target: &str) -> Option<i32> {
    match target {
        "ACCEPT" => Some(VERDICT_ACCEPT),
        "DROP" => Some(VERDICT_DROP),
        "QUEUE" => Some(VERDICT_QUEUE),
        "RETURN" => Some(VERDICT_RETURN),
        _ => None,
    }
}

/// True when the verdict names a disposition rather than a jump offset.
pub fn is_special_verdict(verdict: i32) -> bool {
    matches!(
        verdict,
        VERDICT_RETURN | VERDICT_ACCEPT | VERDICT_DROP | VERDICT_QUEUE | VERDICT_STOP
    )
}

/// IPv4 selector of a rule: addresses, masks, interfaces, invert flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSelector {
    pub src: Option<(Ipv4Addr, Ipv4Addr)>,
    pub dst: Option<(Ipv4Addr, Ipv4Addr)>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub proto: u16,
    pub flags: u8,
    pub invflags: u8,
}

impl IpSelector {
    /// Serialized form; rule equality is bitwise over these bytes.
    pub fn to_bytes(&self) -> [u8; IP_SELECTOR_SIZE] {
        let mut buf = [0u8; IP_SELECTOR_SIZE];

        if let Some((addr, mask)) = self.src {
            buf[0..4].copy_from_slice(&addr.octets());
            buf[8..12].copy_from_slice(&mask.octets());
        }
        if let Some((addr, mask)) = self.dst {
            buf[4..8].copy_from_slice(&addr.octets());
            buf[12..16].copy_from_slice(&mask.octets());
        }

        if let Some(ref name) = self.in_iface {
            let (head, tail) = buf.split_at_mut(48);
            write_iface(&mut head[16..32], &mut tail[0..16], name);
        }
        if let Some(ref name) = self.out_iface {
            let (head, tail) = buf.split_at_mut(64);
            write_iface(&mut head[32..48], &mut tail[0..16], name);
        }

        buf[80..82].copy_from_slice(&self.proto.to_ne_bytes());
        buf[82] = self.flags;
        buf[83] = self.invflags;

        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let read_addr = |off: usize| Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3]);
        let src_mask = read_addr(8);
        let dst_mask = read_addr(12);

        Self {
            src: if src_mask != Ipv4Addr::UNSPECIFIED || read_addr(0) != Ipv4Addr::UNSPECIFIED {
                Some((read_addr(0), src_mask))
            } else {
                None
            },
            dst: if dst_mask != Ipv4Addr::UNSPECIFIED || read_addr(4) != Ipv4Addr::UNSPECIFIED {
                Some((read_addr(4), dst_mask))
            } else {
                None
            },
            in_iface: read_iface(&buf[16..32]),
            out_iface: read_iface(&buf[32..48]),
            proto: u16::from_ne_bytes([buf[80], buf[81]]),
            flags: buf[82],
            invflags: buf[83],
        }
    }
}

fn write_iface(name_field: &mut [u8], mask_field: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(IFACE_NAME_LEN - 1);
    name_field[..len].copy_from_slice(&bytes[..len]);
    // Mask marks significant bytes including the trailing NUL.
    for b in mask_field.iter_mut().take(len + 1) {
        *b = 0xff;
    }
}

fn read_iface(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if end == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&field[..end]).into_owned())
    }
}

/// One match block: opaque extension payload behind an interned name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchBlock {
    pub name: String,
    pub revision: u8,
    pub data: Vec<u8>,
}

impl MatchBlock {
    pub fn size(&self) -> usize {
        blob_align(EXT_HEADER_SIZE + self.data.len())
    }
}

/// Target block of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Built-in disposition or jump; serialized with an empty name.
    Standard { verdict: i32 },
    /// User-chain head marker; the payload is the chain name.
    Error { chain: String },
    /// Extension target (MASQUERADE, SNAT, ...), payload opaque.
    Extension {
        name: String,
        revision: u8,
        data: Vec<u8>,
    },
}

impl Target {
    pub fn size(&self) -> usize {
        match self {
            Target::Standard { .. } => STANDARD_TARGET_SIZE,
            Target::Error { .. } => ERROR_TARGET_SIZE,
            Target::Extension { data, .. } => blob_align(EXT_HEADER_SIZE + data.len()),
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, Target::Standard { .. })
    }
}

/// One mirrored rule: selector + matches + target, plus its position data.
#[derive(Debug, Clone)]
pub struct Rule {
    pub ip: IpSelector,
    pub matches: Vec<MatchBlock>,
    pub target: Target,
    /// Hook index when this rule heads a built-in chain.
    pub builtin: Option<usize>,
    /// Byte offset within the serialized blob; maintained by the table.
    pub offset: usize,
}

impl Rule {
    pub fn new(ip: IpSelector, matches: Vec<MatchBlock>, target: Target) -> Self {
        Self {
            ip,
            matches,
            target,
            builtin: None,
            offset: 0,
        }
    }

    pub fn target_offset(&self) -> usize {
        ENTRY_HEADER_SIZE + self.matches.iter().map(MatchBlock::size).sum::<usize>()
    }

    pub fn next_offset(&self) -> usize {
        self.target_offset() + self.target.size()
    }

    /// Jump verdict, if this rule's standard target points at an offset.
    pub fn jump_verdict(&self) -> Option<i32> {
        match self.target {
            Target::Standard { verdict } if !is_special_verdict(verdict) => Some(verdict),
            _ => None,
        }
    }

    /// A rule that opens a chain: built-in head or user-chain error marker.
    pub fn is_chain_head(&self) -> bool {
        self.builtin.is_some() || matches!(self.target, Target::Error { .. })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.ip.to_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes()); // nfcache
        out.extend_from_slice(&(self.target_offset() as u16).to_ne_bytes());
        out.extend_from_slice(&(self.next_offset() as u16).to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes()); // comefrom
        out.extend_from_slice(&[0u8; 16]); // counters
        debug_assert_eq!(out.len() - start, ENTRY_HEADER_SIZE);

        for m in &self.matches {
            let block_start = out.len();
            out.extend_from_slice(&(m.size() as u16).to_ne_bytes());
            push_name(out, &m.name);
            out.push(m.revision);
            out.extend_from_slice(&m.data);
            pad_to(out, block_start + m.size());
        }

        let block_start = out.len();
        match &self.target {
            Target::Standard { verdict } => {
                out.extend_from_slice(&(STANDARD_TARGET_SIZE as u16).to_ne_bytes());
                push_name(out, "");
                out.push(0);
                out.extend_from_slice(&verdict.to_ne_bytes());
                pad_to(out, block_start + STANDARD_TARGET_SIZE);
            }
            Target::Error { chain } => {
                out.extend_from_slice(&(ERROR_TARGET_SIZE as u16).to_ne_bytes());
                push_name(out, ERROR_TARGET_NAME);
                out.push(0);
                push_fixed(out, chain, TABLE_NAME_LEN);
            }
            Target::Extension {
                name,
                revision,
                data,
            } => {
                out.extend_from_slice(&(self.target.size() as u16).to_ne_bytes());
                push_name(out, name);
                out.push(*revision);
                out.extend_from_slice(data);
                pad_to(out, block_start + self.target.size());
            }
        }
    }

    /// Parse one rule from a kernel blob starting at `buf[0]`; returns the
    /// rule and its total serialized length.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return None;
        }

        let ip = IpSelector::from_bytes(&buf[..IP_SELECTOR_SIZE]);
        let target_offset = u16::from_ne_bytes([buf[88], buf[89]]) as usize;
        let next_offset = u16::from_ne_bytes([buf[90], buf[91]]) as usize;
        if next_offset < target_offset || buf.len() < next_offset {
            return None;
        }

        let mut matches = Vec::new();
        let mut pos = ENTRY_HEADER_SIZE;
        while pos < target_offset {
            let size = u16::from_ne_bytes([buf[pos], buf[pos + 1]]) as usize;
            if size < EXT_HEADER_SIZE || pos + size > target_offset {
                return None;
            }
            matches.push(MatchBlock {
                name: parse_name(&buf[pos + 2..pos + 2 + EXT_NAME_LEN]),
                revision: buf[pos + 2 + EXT_NAME_LEN],
                data: buf[pos + EXT_HEADER_SIZE..pos + size].to_vec(),
            });
            pos += size;
        }

        let tpos = target_offset;
        if tpos + EXT_HEADER_SIZE > next_offset {
            return None;
        }
        let tsize = u16::from_ne_bytes([buf[tpos], buf[tpos + 1]]) as usize;
        if tsize < EXT_HEADER_SIZE || tpos + tsize > next_offset {
            return None;
        }
        let tname = parse_name(&buf[tpos + 2..tpos + 2 + EXT_NAME_LEN]);
        let revision = buf[tpos + 2 + EXT_NAME_LEN];

        let target = if tname.is_empty() {
            if tsize < EXT_HEADER_SIZE + 4 {
                return None;
            }
            let v = i32::from_ne_bytes([
                buf[tpos + EXT_HEADER_SIZE],
                buf[tpos + EXT_HEADER_SIZE + 1],
                buf[tpos + EXT_HEADER_SIZE + 2],
                buf[tpos + EXT_HEADER_SIZE + 3],
            ]);
            Target::Standard { verdict: v }
        } else if tname == ERROR_TARGET_NAME {
            if tsize < EXT_HEADER_SIZE + TABLE_NAME_LEN {
                return None;
            }
            Target::Error {
                chain: parse_name(&buf[tpos + EXT_HEADER_SIZE..tpos + EXT_HEADER_SIZE + TABLE_NAME_LEN]),
            }
        } else {
            Target::Extension {
                name: tname,
                revision,
                data: buf[tpos + EXT_HEADER_SIZE..tpos + tsize].to_vec(),
            }
        };

        Some((Rule::new(ip, matches, target), next_offset))
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    push_fixed(out, name, EXT_NAME_LEN);
}

fn push_fixed(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + width - len, 0);
}

fn parse_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn pad_to(out: &mut Vec<u8>, target_len: usize) {
    debug_assert!(out.len() <= target_len);
    out.resize(target_len, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_rule_sizes() {
        let rule = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Standard {
                verdict: VERDICT_ACCEPT,
            },
        );
        assert_eq!(rule.target_offset(), ENTRY_HEADER_SIZE);
        assert_eq!(rule.next_offset(), ENTRY_HEADER_SIZE + STANDARD_TARGET_SIZE);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let ip = IpSelector {
            src: Some(("10.0.0.1".parse().unwrap(), "255.255.255.255".parse().unwrap())),
            out_iface: Some("eth0".to_string()),
            ..Default::default()
        };
        let rule = Rule::new(
            ip.clone(),
            vec![MatchBlock {
                name: "state".to_string(),
                revision: 0,
                data: vec![1, 2, 3, 4],
            }],
            Target::Extension {
                name: "MASQUERADE".to_string(),
                revision: 0,
                data: vec![0; 16],
            },
        );

        let mut buf = Vec::new();
        rule.serialize(&mut buf);
        assert_eq!(buf.len(), rule.next_offset());
        assert_eq!(buf.len() % BLOB_ALIGN, 0);

        let (parsed, consumed) = Rule::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.ip.to_bytes(), ip.to_bytes());
        assert_eq!(parsed.matches.len(), 1);
        assert_eq!(parsed.matches[0].name, "state");
        assert_eq!(parsed.target, rule.target);

        // Parsed match payloads carry their padding; the byte form is the
        // canonical representation and survives a second pass unchanged.
        let mut reserialized = Vec::new();
        parsed.serialize(&mut reserialized);
        assert_eq!(reserialized, buf);
    }

    #[test]
    fn test_error_target_carries_chain_name() {
        let rule = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Error {
                chain: "tether-nat".to_string(),
            },
        );
        let mut buf = Vec::new();
        rule.serialize(&mut buf);

        let (parsed, _) = Rule::parse(&buf).unwrap();
        match parsed.target {
            Target::Error { chain } => assert_eq!(chain, "tether-nat"),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_jump_detection() {
        let jump = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Standard { verdict: 312 },
        );
        assert_eq!(jump.jump_verdict(), Some(312));

        let drop = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Standard {
                verdict: VERDICT_DROP,
            },
        );
        assert_eq!(drop.jump_verdict(), None);
    }
}
