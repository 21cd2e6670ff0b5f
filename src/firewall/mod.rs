//! Packet-filter rule engine
//!
//! Keeps an in-memory mirror per kernel table, mutates it with chain and
//! rule operations, and submits the whole table back to the kernel as one
//! atomic replace. Mirrors live in a map keyed by table name; a successful
//! commit drops the mirror, a failed one keeps it for the caller to retry
//! or abandon.

pub mod entry;
pub mod socket;
pub mod table;

pub use entry::IpSelector;
pub use socket::{NetfilterSocket, RawNetfilterSocket, ReplaceBlob, TableInfo};
pub use table::{EmptyRegistry, ExtensionRegistry, RuleSpec, Table};

use crate::error::{ConnError, ConnResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

pub struct FirewallManager {
    tables: Mutex<HashMap<String, Table>>,
    socket: Box<dyn NetfilterSocket>,
    registry: Box<dyn ExtensionRegistry>,
}

impl FirewallManager {
    pub fn new(socket: Box<dyn NetfilterSocket>) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            socket,
            registry: Box::new(EmptyRegistry),
        }
    }

    pub fn with_registry(mut self, registry: Box<dyn ExtensionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Load the kernel table into the mirror map if not mirrored yet.
    pub fn init(&self, table: &str) -> ConnResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(table) {
            return Ok(());
        }

        let info = self.socket.info(table)?;
        let blob = self.socket.entries(table, info.size as usize)?;
        let mirror = Table::from_kernel(&info, &blob)?;

        debug!(
            "mirrored table {} ({} entries, {} bytes)",
            table,
            mirror.num_entries(),
            mirror.size()
        );
        tables.insert(table.to_string(), mirror);
        Ok(())
    }

    fn with_table<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Table, &dyn ExtensionRegistry) -> ConnResult<R>,
    ) -> ConnResult<R> {
        self.init(table)?;
        let mut tables = self.tables.lock().unwrap();
        let mirror = tables
            .get_mut(table)
            .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))?;
        f(mirror, self.registry.as_ref())
    }

    pub fn add_chain(&self, table: &str, chain: &str) -> ConnResult<()> {
        self.with_table(table, |t, _| t.add_chain(chain))
    }

    pub fn delete_chain(&self, table: &str, chain: &str) -> ConnResult<()> {
        self.with_table(table, |t, _| t.delete_chain(chain))
    }

    pub fn flush_chain(&self, table: &str, chain: &str) -> ConnResult<()> {
        self.with_table(table, |t, _| t.flush_chain(chain))
    }

    pub fn append_rule(&self, table: &str, chain: &str, spec: &RuleSpec) -> ConnResult<()> {
        self.with_table(table, |t, r| t.append_rule(chain, spec, r))
    }

    pub fn insert_rule(&self, table: &str, chain: &str, spec: &RuleSpec) -> ConnResult<()> {
        self.with_table(table, |t, r| t.insert_rule(chain, spec, r))
    }

    pub fn delete_rule(&self, table: &str, chain: &str, spec: &RuleSpec) -> ConnResult<()> {
        self.with_table(table, |t, r| t.delete_rule(chain, spec, r))
    }

    pub fn change_policy(&self, table: &str, chain: &str, policy: &str) -> ConnResult<()> {
        self.with_table(table, |t, _| t.change_policy(chain, policy))
    }

    pub fn dump(&self, table: &str) -> ConnResult<()> {
        self.with_table(table, |t, _| {
            t.dump();
            Ok(())
        })
    }

    /// Serialize the mirror and hand it to the kernel. All-or-nothing: on
    /// success the mirror is dropped from the map, on failure it stays.
    pub fn commit(&self, table: &str) -> ConnResult<()> {
        let blob = {
            let tables = self.tables.lock().unwrap();
            let mirror = tables
                .get(table)
                .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))?;
            mirror.blob()
        };

        self.socket.replace(&blob)?;

        self.tables.lock().unwrap().remove(table);
        debug!("committed table {}", table);
        Ok(())
    }

    /// iptables-style one-liner for internal callers, e.g.
    /// `-t nat -A POSTROUTING -o wlan0 -j MASQUERADE`.
    pub fn command(&self, line: &str) -> ConnResult<()> {
        let cmd = Command::parse(line)?;
        let table = cmd.table.as_deref().unwrap_or("filter");

        match cmd.action {
            Action::Append(ref chain) => self.append_rule(table, chain, &cmd.spec()?),
            Action::Insert(ref chain) => self.insert_rule(table, chain, &cmd.spec()?),
            Action::Delete(ref chain) => self.delete_rule(table, chain, &cmd.spec()?),
            Action::Flush(chain) => self.flush_chain(table, &chain),
            Action::NewChain(chain) => self.add_chain(table, &chain),
            Action::DeleteChain(chain) => self.delete_chain(table, &chain),
            Action::Policy(chain, policy) => self.change_policy(table, &chain, &policy),
            Action::List => self.dump(table),
        }
    }
}

enum Action {
    Append(String),
    Insert(String),
    Delete(String),
    Flush(String),
    NewChain(String),
    DeleteChain(String),
    Policy(String, String),
    List,
}

struct Command {
    table: Option<String>,
    action: Action,
    ip: IpSelector,
    target: Option<String>,
    matches: Vec<String>,
}

impl Command {
    fn parse(line: &str) -> ConnResult<Self> {
        use entry::{INV_DST, INV_SRC, INV_VIA_IN, INV_VIA_OUT};

        fn next_arg(tokens: &mut std::str::SplitWhitespace<'_>, flag: &str) -> ConnResult<String> {
            tokens
                .next()
                .map(str::to_string)
                .ok_or_else(|| ConnError::InvalidArgument(format!("{} needs an argument", flag)))
        }

        let mut tokens = line.split_whitespace();
        let mut table = None;
        let mut action = None;
        let mut ip = IpSelector::default();
        let mut target = None;
        let mut matches = Vec::new();
        let mut invert = false;

        while let Some(token) = tokens.next() {
            match token {
                "!" => {
                    invert = true;
                    continue;
                }
                "-t" => table = Some(next_arg(&mut tokens, token)?),
                "-A" => action = Some(Action::Append(next_arg(&mut tokens, token)?)),
                "-I" => action = Some(Action::Insert(next_arg(&mut tokens, token)?)),
                "-D" => action = Some(Action::Delete(next_arg(&mut tokens, token)?)),
                "-F" => action = Some(Action::Flush(next_arg(&mut tokens, token)?)),
                "-N" => action = Some(Action::NewChain(next_arg(&mut tokens, token)?)),
                "-X" => action = Some(Action::DeleteChain(next_arg(&mut tokens, token)?)),
                "-P" => {
                    let chain = next_arg(&mut tokens, token)?;
                    let policy = next_arg(&mut tokens, token)?;
                    action = Some(Action::Policy(chain, policy));
                }
                "-L" => action = Some(Action::List),
                "-j" => target = Some(next_arg(&mut tokens, token)?),
                "-m" => matches.push(next_arg(&mut tokens, token)?),
                "-s" => {
                    ip.src = Some(parse_addr_mask(&next_arg(&mut tokens, token)?)?);
                    if invert {
                        ip.invflags |= INV_SRC;
                    }
                }
                "-d" => {
                    ip.dst = Some(parse_addr_mask(&next_arg(&mut tokens, token)?)?);
                    if invert {
                        ip.invflags |= INV_DST;
                    }
                }
                "-i" => {
                    ip.in_iface = Some(next_arg(&mut tokens, token)?);
                    if invert {
                        ip.invflags |= INV_VIA_IN;
                    }
                }
                "-o" => {
                    ip.out_iface = Some(next_arg(&mut tokens, token)?);
                    if invert {
                        ip.invflags |= INV_VIA_OUT;
                    }
                }
                other => {
                    return Err(ConnError::InvalidArgument(format!(
                        "unknown option {}",
                        other
                    )))
                }
            }
            invert = false;
        }

        let action = action.ok_or_else(|| ConnError::InvalidArgument("no action given".into()))?;

        Ok(Self {
            table,
            action,
            ip,
            target,
            matches,
        })
    }

    fn spec(&self) -> ConnResult<RuleSpec> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| ConnError::InvalidArgument("rule needs a -j target".into()))?;
        Ok(RuleSpec {
            ip: self.ip.clone(),
            target,
            matches: self.matches.clone(),
        })
    }
}

fn parse_addr_mask(text: &str) -> ConnResult<(std::net::Ipv4Addr, std::net::Ipv4Addr)> {
    let (addr_str, mask) = match text.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| ConnError::InvalidArgument(format!("prefix in {}", text)))?;
            if prefix > 32 {
                return Err(ConnError::InvalidArgument(format!("prefix in {}", text)));
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            (addr, std::net::Ipv4Addr::from(mask))
        }
        None => (text, std::net::Ipv4Addr::new(255, 255, 255, 255)),
    };

    let addr = addr_str
        .parse()
        .map_err(|_| ConnError::InvalidArgument(format!("address {}", text)))?;
    Ok((addr, mask))
}
