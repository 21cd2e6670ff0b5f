//! Firewall engine scenarios against an in-memory kernel.

use libconnctl::error::{ConnError, ConnResult};
use libconnctl::firewall::entry::{
    IpSelector, Rule, Target, ENTRY_HEADER_SIZE, NUM_HOOKS, STANDARD_TARGET_SIZE, VERDICT_ACCEPT,
};
use libconnctl::firewall::{FirewallManager, NetfilterSocket, ReplaceBlob, TableInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

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

fn build_table(name: &str, hooks: &[usize]) -> (TableInfo, Vec<u8>) {
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

/// In-memory kernel: serves the pristine tables, records every replace.
struct MemoryKernel {
    tables: HashMap<String, (TableInfo, Vec<u8>)>,
    committed: Mutex<Vec<ReplaceBlob>>,
}

impl MemoryKernel {
    fn new() -> Arc<Self> {
        let mut tables = HashMap::new();
        tables.insert("filter".to_string(), build_table("filter", &[1, 2, 3]));
        tables.insert("nat".to_string(), build_table("nat", &[0, 3, 4]));
        Arc::new(Self {
            tables,
            committed: Mutex::new(Vec::new()),
        })
    }

    fn last_commit(&self) -> ReplaceBlob {
        self.committed.lock().unwrap().last().cloned().unwrap()
    }
}

/// Handle passed into the manager; the test keeps its own Arc to inspect
/// what was committed.
struct KernelHandle(Arc<MemoryKernel>);

impl NetfilterSocket for KernelHandle {
    fn info(&self, table: &str) -> ConnResult<TableInfo> {
        self.0
            .tables
            .get(table)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))
    }

    fn entries(&self, table: &str, _size: usize) -> ConnResult<Vec<u8>> {
        self.0
            .tables
            .get(table)
            .map(|(_, blob)| blob.clone())
            .ok_or_else(|| ConnError::NotFound(format!("table {}", table)))
    }

    fn replace(&self, blob: &ReplaceBlob) -> ConnResult<()> {
        self.0.committed.lock().unwrap().push(blob.clone());
        Ok(())
    }
}

fn manager_over(kernel: &Arc<MemoryKernel>) -> FirewallManager {
    FirewallManager::new(Box::new(KernelHandle(kernel.clone())))
}

#[test]
fn insert_then_delete_commits_byte_identical_table() {
    let kernel = MemoryKernel::new();
    let firewall = manager_over(&kernel);

    // Baseline: commit the untouched mirror.
    firewall.init("filter").unwrap();
    firewall.commit("filter").unwrap();
    let baseline = kernel.last_commit();

    // Fresh mirror: append then delete the same rule, commit again.
    firewall.command("-A INPUT -s 10.0.0.1/32 -j DROP").unwrap();
    firewall.command("-D INPUT -s 10.0.0.1/32 -j DROP").unwrap();
    firewall.commit("filter").unwrap();

    let roundtrip = kernel.last_commit();
    assert_eq!(roundtrip.entries, baseline.entries);
    assert_eq!(roundtrip.hook_entry, baseline.hook_entry);
    assert_eq!(roundtrip.underflow, baseline.underflow);
    assert_eq!(roundtrip.size, baseline.size);
    assert_eq!(roundtrip.num_entries, baseline.num_entries);
}

#[test]
fn appended_rule_shifts_cursors_by_its_size() {
    let kernel = MemoryKernel::new();
    let (info, _) = kernel.tables.get("filter").unwrap().clone();
    let firewall = manager_over(&kernel);

    firewall.command("-A INPUT -s 10.0.0.1/32 -j DROP").unwrap();
    firewall.commit("filter").unwrap();

    let committed = kernel.last_commit();
    let added = (ENTRY_HEADER_SIZE + STANDARD_TARGET_SIZE) as u32;

    // The rule sits under the INPUT head: hook_entry stays, underflow and
    // every later chain shift by exactly the rule size.
    assert_eq!(committed.hook_entry[1], info.hook_entry[1]);
    assert_eq!(committed.underflow[1], info.underflow[1] + added);
    assert_eq!(committed.hook_entry[2], info.hook_entry[2] + added);
    assert_eq!(committed.underflow[2], info.underflow[2] + added);
    assert_eq!(committed.hook_entry[3], info.hook_entry[3] + added);
    assert_eq!(committed.underflow[3], info.underflow[3] + added);
    assert_eq!(committed.size, info.size + added);
    assert_eq!(committed.num_entries, info.num_entries + 1);
    // The counter array is sized to the replaced table's entry count.
    assert_eq!(committed.num_counters, info.num_entries);
}

#[test]
fn masquerade_cycle_leaves_nat_pristine() {
    let kernel = MemoryKernel::new();
    let firewall = manager_over(&kernel);

    // Baseline nat blob.
    firewall.init("nat").unwrap();
    firewall.commit("nat").unwrap();
    let baseline = kernel.last_commit();

    firewall.command("-t nat -F POSTROUTING").unwrap();
    firewall
        .command("-t nat -A POSTROUTING -o wlan0 -j MASQUERADE")
        .unwrap();
    firewall.commit("nat").unwrap();
    assert_ne!(kernel.last_commit().entries, baseline.entries);

    // Uplink change: flush then re-append for the new interface.
    firewall.command("-t nat -F POSTROUTING").unwrap();
    firewall
        .command("-t nat -A POSTROUTING -o eth0 -j MASQUERADE")
        .unwrap();
    firewall.commit("nat").unwrap();

    // Disable: flush only; the table returns to its pristine bytes.
    firewall.command("-t nat -F POSTROUTING").unwrap();
    firewall.commit("nat").unwrap();
    assert_eq!(kernel.last_commit().entries, baseline.entries);
}

#[test]
fn user_chain_lifecycle() {
    let kernel = MemoryKernel::new();
    let firewall = manager_over(&kernel);

    firewall.command("-N guard").unwrap();
    firewall.command("-A guard -s 10.9.0.0/16 -j DROP").unwrap();
    firewall.command("-A INPUT -j guard").unwrap();

    // The chain is not empty; deleting it must fail.
    assert!(firewall.command("-X guard").is_err());

    firewall.command("-D INPUT -j guard").unwrap();
    firewall.command("-F guard").unwrap();
    firewall.command("-X guard").unwrap();
    firewall.commit("filter").unwrap();

    // After the full cycle the committed blob matches a pristine table.
    let fresh_kernel = MemoryKernel::new();
    let fresh = manager_over(&fresh_kernel);
    fresh.init("filter").unwrap();
    fresh.commit("filter").unwrap();
    assert_eq!(
        kernel.last_commit().entries,
        fresh_kernel.last_commit().entries
    );
}
