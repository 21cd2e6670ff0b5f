//! In-memory mirror of one kernel packet-filter table
//!
//! The mirror holds the table as an ordered list of variable-length rule
//! records plus the per-hook byte cursors. Every structural mutation keeps
//! three things consistent: the running byte offsets of all rules, the
//! `hook_entry`/`underflow` cursors of every built-in chain at or after the
//! mutation point, and the verdicts of standard-target jumps that cross the
//! modified region. The serialized form of the whole list is the blob the
//! kernel accepts for atomic replacement.

use super::entry::{
    verdict_for, HOOK_NAMES, IpSelector, MatchBlock, NUM_HOOKS, Rule, Target, VERDICT_RETURN,
};
use super::socket::{ReplaceBlob, TableInfo};
use crate::error::{ConnError, ConnResult};
use tracing::{debug, info};

/// Resolves opaque extension names to their kernel payloads. The mirror
/// itself never interprets extension data.
pub trait ExtensionRegistry: Send + Sync {
    fn target_payload(&self, name: &str) -> (u8, Vec<u8>);
    fn match_payload(&self, name: &str) -> (u8, Vec<u8>);
}

/// Default registry: zero-revision, empty payloads.
pub struct EmptyRegistry;

impl ExtensionRegistry for EmptyRegistry {
    fn target_payload(&self, _name: &str) -> (u8, Vec<u8>) {
        (0, Vec::new())
    }

    fn match_payload(&self, _name: &str) -> (u8, Vec<u8>) {
        (0, Vec::new())
    }
}

/// Caller-side description of a rule: selector, target name, match names.
#[derive(Debug, Clone, Default)]
pub struct RuleSpec {
    pub ip: IpSelector,
    pub target: String,
    pub matches: Vec<String>,
}

pub struct Table {
    name: String,
    valid_hooks: u32,
    hook_entry: [u32; NUM_HOOKS],
    underflow: [u32; NUM_HOOKS],
    /// Entry count of the kernel's current table; sizes the counter array
    /// in the replace blob.
    old_entries: usize,
    size: usize,
    rules: Vec<Rule>,
}

impl Table {
    /// Build the mirror from the kernel's info and entry blob.
    pub fn from_kernel(info: &TableInfo, blob: &[u8]) -> ConnResult<Self> {
        let mut table = Self {
            name: info.name.clone(),
            valid_hooks: info.valid_hooks,
            hook_entry: info.hook_entry,
            underflow: info.underflow,
            old_entries: info.num_entries as usize,
            size: 0,
            rules: Vec::new(),
        };

        let mut pos = 0usize;
        while pos < blob.len() {
            let (mut rule, consumed) = Rule::parse(&blob[pos..]).ok_or_else(|| {
                ConnError::Protocol(format!("malformed table blob at offset {}", pos))
            })?;

            rule.offset = pos;
            rule.builtin = (0..NUM_HOOKS).find(|&hook| {
                info.valid_hooks & (1 << hook) != 0 && info.hook_entry[hook] as usize == pos
            });

            table.size += consumed;
            table.rules.push(rule);
            pos += consumed;
        }

        if pos != blob.len() {
            return Err(ConnError::Protocol("trailing bytes in table blob".into()));
        }

        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_entries(&self) -> usize {
        self.rules.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hook_entry(&self) -> &[u32; NUM_HOOKS] {
        &self.hook_entry
    }

    pub fn underflow(&self) -> &[u32; NUM_HOOKS] {
        &self.underflow
    }

    /// First rule heading the named chain: a built-in head whose hook names
    /// the chain, or an error-target marker carrying the chain name.
    fn find_chain_head(&self, chain: &str) -> Option<usize> {
        self.rules.iter().position(|rule| {
            if let Some(hook) = rule.builtin {
                if HOOK_NAMES[hook] == chain {
                    return true;
                }
            }
            matches!(&rule.target, Target::Error { chain: name } if name == chain)
        })
    }

    /// First chain head after this chain's head; the table end otherwise.
    fn find_chain_tail(&self, chain: &str) -> Option<usize> {
        let head = self.find_chain_head(chain)?;
        for idx in head + 1..self.rules.len() {
            if self.rules[idx].is_chain_head() {
                return Some(idx);
            }
        }
        Some(self.rules.len().checked_sub(1)?)
    }

    /// Recompute every rule's byte offset from the running sum.
    fn update_offsets(&mut self) {
        let mut offset = 0usize;
        for rule in &mut self.rules {
            rule.offset = offset;
            offset += rule.next_offset();
        }
    }

    /// Shift jump verdicts that land past `boundary` after an insertion of
    /// `delta` bytes, or at/past it after a removal.
    fn update_jump_targets(&mut self, boundary: usize, delta: usize, removing: bool) {
        for rule in &mut self.rules {
            let Some(verdict) = rule.jump_verdict() else {
                continue;
            };
            let shifted = if removing {
                if verdict as usize >= boundary {
                    Some(verdict - delta as i32)
                } else {
                    None
                }
            } else if verdict as usize > boundary {
                Some(verdict + delta as i32)
            } else {
                None
            };
            if let Some(v) = shifted {
                rule.target = Target::Standard { verdict: v };
            }
        }
    }

    /// Splice `rule` into the order. `before == None` appends at the table
    /// end; otherwise the rule lands in front of the given position and all
    /// offsets and jump references are rebuilt.
    fn add_rule_at(&mut self, mut rule: Rule, before: Option<usize>) {
        let added = rule.next_offset();
        self.size += added;

        match before {
            None => {
                rule.offset = self.size - added;
                self.rules.push(rule);
            }
            Some(idx) => {
                let boundary = self.rules[idx].offset;
                self.rules.insert(idx, rule);
                self.update_jump_targets(boundary, added, false);
                self.update_offsets();
            }
        }
    }

    fn remove_rule_at(&mut self, idx: usize) -> usize {
        let removed = self.rules[idx].next_offset();
        self.size -= removed;
        self.rules.remove(idx);
        removed
    }

    /// Bump underflow of this chain and both cursors of every later built-in
    /// chain by the incoming rule's length.
    fn update_hooks(&mut self, head: usize, delta: usize) {
        let Some(hook) = self.rules[head].builtin else {
            return;
        };
        self.underflow[hook] += delta as u32;

        for rule in &self.rules[head + 1..] {
            if let Some(hook) = rule.builtin {
                self.hook_entry[hook] += delta as u32;
                self.underflow[hook] += delta as u32;
            }
        }
    }

    fn shift_hooks_down(&mut self, from: usize, removed: usize) {
        for rule in &self.rules[from..] {
            if let Some(hook) = rule.builtin {
                self.hook_entry[hook] -= removed as u32;
                self.underflow[hook] -= removed as u32;
            }
        }
    }

    /// Resolve the target name: built-in disposition, user-chain jump, or
    /// opaque extension.
    fn resolve_target(&self, name: &str, registry: &dyn ExtensionRegistry) -> Target {
        if let Some(verdict) = verdict_for(name) {
            return Target::Standard { verdict };
        }

        if let Some(head) = self.find_chain_head(name) {
            if head + 1 < self.rules.len() {
                return Target::Standard {
                    verdict: self.rules[head + 1].offset as i32,
                };
            }
        }

        let (revision, data) = registry.target_payload(name);
        Target::Extension {
            name: name.to_string(),
            revision,
            data,
        }
    }

    fn build_rule(&self, spec: &RuleSpec, registry: &dyn ExtensionRegistry) -> Rule {
        let matches = spec
            .matches
            .iter()
            .map(|name| {
                let (revision, data) = registry.match_payload(name);
                MatchBlock {
                    name: name.clone(),
                    revision,
                    data,
                }
            })
            .collect();

        Rule::new(spec.ip.clone(), matches, self.resolve_target(&spec.target, registry))
    }

    /// Shared prologue of append/insert: build the rule, advance the hook
    /// cursors, and hand the built-in flag over when the rule becomes the
    /// first of an empty built-in chain.
    fn prepare_rule(
        &mut self,
        chain: &str,
        spec: &RuleSpec,
        registry: &dyn ExtensionRegistry,
    ) -> ConnResult<(Rule, Option<usize>)> {
        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;
        let tail = self
            .find_chain_tail(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        let rule = self.build_rule(spec, registry);
        self.update_hooks(head, rule.next_offset());

        let mut builtin = None;
        if self.rules[head].builtin.is_some() && head + 1 == tail {
            builtin = self.rules[head].builtin.take();
        }

        Ok((rule, builtin))
    }

    pub fn append_rule(
        &mut self,
        chain: &str,
        spec: &RuleSpec,
        registry: &dyn ExtensionRegistry,
    ) -> ConnResult<()> {
        let tail = self
            .find_chain_tail(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;
        if tail == 0 {
            return Err(ConnError::InvalidState(format!("chain {} has no tail", chain)));
        }

        let (mut rule, builtin) = self.prepare_rule(chain, spec, registry)?;
        rule.builtin = builtin;
        self.add_rule_at(rule, Some(tail - 1));
        Ok(())
    }

    pub fn insert_rule(
        &mut self,
        chain: &str,
        spec: &RuleSpec,
        registry: &dyn ExtensionRegistry,
    ) -> ConnResult<()> {
        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        let (mut rule, builtin) = self.prepare_rule(chain, spec, registry)?;
        rule.builtin = builtin;
        self.add_rule_at(rule, Some(head + 1));
        Ok(())
    }

    pub fn delete_rule(
        &mut self,
        chain: &str,
        spec: &RuleSpec,
        registry: &dyn ExtensionRegistry,
    ) -> ConnResult<()> {
        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;
        let tail = self
            .find_chain_tail(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        let test = self.build_rule(spec, registry);
        let builtin = self.rules[head].builtin;

        let start = if builtin.is_some() { head } else { head + 1 };
        let stop = tail.saturating_sub(1);

        let idx = (start..stop)
            .find(|&idx| rules_equal(&self.rules[idx], &test))
            .ok_or_else(|| ConnError::NotFound(format!("rule in chain {}", chain)))?;

        // References past the removal point shift back by the removed size;
        // the boundary is the offset of the rule that follows.
        if idx + 1 < self.rules.len() {
            let boundary = self.rules[idx + 1].offset;
            let removed = self.rules[idx].next_offset();
            self.update_jump_targets(boundary, removed, true);
        }

        let removed = self.remove_rule_at(idx);

        if let Some(hook) = builtin {
            if idx < self.rules.len() {
                self.rules[idx].builtin = Some(hook);
            }
            self.underflow[hook] -= removed as u32;
            self.shift_hooks_down(tail - 1, removed);
        }

        self.update_offsets();
        Ok(())
    }

    pub fn flush_chain(&mut self, chain: &str) -> ConnResult<()> {
        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;
        let tail = self
            .find_chain_tail(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        let builtin = self.rules[head].builtin;
        let start = if builtin.is_some() { head } else { head + 1 };
        let stop = tail.saturating_sub(1);

        if start >= stop {
            return Ok(());
        }

        let mut removed = 0usize;
        for rule in self.rules.drain(start..stop) {
            removed += rule.next_offset();
        }
        self.size -= removed;

        if let Some(hook) = builtin {
            // The trailing policy entry becomes the chain head again.
            self.rules[start].builtin = Some(hook);
            self.underflow[hook] -= removed as u32;
            self.shift_hooks_down(start + 1, removed);
        }

        self.update_offsets();
        Ok(())
    }

    /// An empty user chain is a head entry whose error-target data is the
    /// chain name, followed by a RETURN entry. Both land in front of the
    /// table's trailing policy entry.
    pub fn add_chain(&mut self, chain: &str) -> ConnResult<()> {
        let last = self
            .rules
            .len()
            .checked_sub(1)
            .ok_or_else(|| ConnError::InvalidState("empty table".into()))?;

        let head = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Error {
                chain: chain.to_string(),
            },
        );
        self.add_rule_at(head, Some(last));

        let last = self.rules.len() - 1;
        let tail = Rule::new(
            IpSelector::default(),
            Vec::new(),
            Target::Standard {
                verdict: VERDICT_RETURN,
            },
        );
        self.add_rule_at(tail, Some(last));

        Ok(())
    }

    pub fn delete_chain(&mut self, chain: &str) -> ConnResult<()> {
        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        if self.rules[head].builtin.is_some() {
            return Err(ConnError::NotSupported(
                "built-in chains cannot be removed".into(),
            ));
        }

        let tail = self
            .find_chain_tail(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        // Only the head marker and the RETURN entry may remain.
        if head + 1 != tail - 1 {
            return Err(ConnError::InvalidState(format!("chain {} not empty", chain)));
        }

        self.remove_rule_at(head);
        self.remove_rule_at(head);
        self.update_offsets();
        Ok(())
    }

    pub fn change_policy(&mut self, chain: &str, policy: &str) -> ConnResult<()> {
        let verdict = verdict_for(policy)
            .ok_or_else(|| ConnError::InvalidArgument(format!("policy {}", policy)))?;

        let head = self
            .find_chain_head(chain)
            .ok_or_else(|| ConnError::NotFound(format!("chain {}", chain)))?;

        if self.rules[head].builtin.is_none() {
            return Err(ConnError::NotSupported(
                "policies apply to built-in chains only".into(),
            ));
        }

        match &mut self.rules[head].target {
            Target::Standard { verdict: v } => {
                *v = verdict;
                Ok(())
            }
            _ => Err(ConnError::InvalidState(format!(
                "chain {} head has no standard target",
                chain
            ))),
        }
    }

    /// Serialize the mirror into the kernel replace blob. The counter array
    /// is sized to the entry count of the table being replaced.
    pub fn blob(&self) -> ReplaceBlob {
        let mut entries = Vec::with_capacity(self.size);
        for rule in &self.rules {
            rule.serialize(&mut entries);
        }
        debug_assert_eq!(entries.len(), self.size);

        ReplaceBlob {
            name: self.name.clone(),
            valid_hooks: self.valid_hooks,
            num_entries: self.rules.len() as u32,
            size: self.size as u32,
            hook_entry: self.hook_entry,
            underflow: self.underflow,
            num_counters: self.old_entries as u32,
            entries,
        }
    }

    /// Log the mirrored table, chain heads first.
    pub fn dump(&self) {
        info!(
            "{} valid_hooks=0x{:08x} num_entries={} size={}",
            self.name,
            self.valid_hooks,
            self.rules.len(),
            self.size
        );

        for rule in &self.rules {
            if let Some(hook) = rule.builtin {
                info!("CHAIN ({}) offset {} size {}", HOOK_NAMES[hook], rule.offset,
                        rule.next_offset());
            } else if let Target::Error { chain } = &rule.target {
                info!("USER CHAIN ({}) offset {} size {}", chain, rule.offset,
                        rule.next_offset());
            } else {
                debug!("RULE offset {} size {}", rule.offset, rule.next_offset());
            }
        }
    }

    /// Invariant check used by tests: offsets are the running sum and every
    /// jump verdict names an existing rule offset.
    #[cfg(test)]
    pub fn check_consistency(&self) {
        let mut offset = 0usize;
        for rule in &self.rules {
            assert_eq!(rule.offset, offset, "offset chain broken");
            offset += rule.next_offset();
        }
        assert_eq!(offset, self.size, "size out of sync");

        for rule in &self.rules {
            if let Some(verdict) = rule.jump_verdict() {
                assert!(
                    self.rules.iter().any(|r| r.offset == verdict as usize),
                    "dangling jump target {}",
                    verdict
                );
            }
        }
    }
}

/// Delete-time equality: bitwise selector, both offsets, target identity
/// (verdict for standard targets, length+name otherwise), first match block
/// identity when the probe carries one.
fn rules_equal(candidate: &Rule, test: &Rule) -> bool {
    if candidate.ip.to_bytes() != test.ip.to_bytes() {
        return false;
    }
    if candidate.target_offset() != test.target_offset()
        || candidate.next_offset() != test.next_offset()
    {
        return false;
    }

    let target_same = match (&candidate.target, &test.target) {
        (Target::Standard { verdict: a }, Target::Standard { verdict: b }) => a == b,
        (a, b) => a.size() == b.size() && target_name(a) == target_name(b),
    };
    if !target_same {
        return false;
    }

    match (candidate.matches.first(), test.matches.first()) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(a), Some(b)) => a.size() == b.size() && a.revision == b.revision && a.name == b.name,
    }
}

fn target_name(target: &Target) -> &str {
    match target {
        Target::Standard { .. } => "",
        Target::Error { .. } => super::entry::ERROR_TARGET_NAME,
        Target::Extension { name, .. } => name,
    }
}

#[cfg(test)]
mod tests {
    use super::super::socket::tests::{filter_fixture, nat_fixture};
    use super::super::entry::{STANDARD_TARGET_SIZE, ENTRY_HEADER_SIZE};
    use super::*;

    fn filter_table() -> Table {
        let (info, blob) = filter_fixture();
        Table::from_kernel(&info, &blob).unwrap()
    }

    fn drop_from(src: &str) -> RuleSpec {
        RuleSpec {
            ip: IpSelector {
                src: Some((src.parse().unwrap(), "255.255.255.255".parse().unwrap())),
                ..Default::default()
            },
            target: "DROP".to_string(),
            matches: Vec::new(),
        }
    }

    #[test]
    fn test_initial_mirror_consistent() {
        let table = filter_table();
        table.check_consistency();
        assert_eq!(table.num_entries(), 4);
        assert_eq!(table.hook_entry()[1], 0);
    }

    #[test]
    fn test_append_shifts_underflow_not_hook_entry() {
        let mut table = filter_table();
        let before_underflow = table.underflow()[1];

        table
            .append_rule("INPUT", &drop_from("10.0.0.1"), &EmptyRegistry)
            .unwrap();
        table.check_consistency();

        let added = (ENTRY_HEADER_SIZE + STANDARD_TARGET_SIZE) as u32;
        assert_eq!(table.hook_entry()[1], 0);
        assert_eq!(table.underflow()[1], before_underflow + added);
        // FORWARD and OUTPUT sit after the insertion point; both cursors move.
        assert_eq!(table.hook_entry()[2], 152 + added);
        assert_eq!(table.underflow()[2], 152 + added);
        assert_eq!(table.hook_entry()[3], 304 + added);
    }

    #[test]
    fn test_append_then_delete_restores_blob() {
        let mut table = filter_table();
        let initial = table.blob();

        let spec = drop_from("10.0.0.1");
        table.append_rule("INPUT", &spec, &EmptyRegistry).unwrap();
        table.check_consistency();
        assert_ne!(table.blob().entries, initial.entries);

        table.delete_rule("INPUT", &spec, &EmptyRegistry).unwrap();
        table.check_consistency();

        let restored = table.blob();
        assert_eq!(restored.entries, initial.entries);
        assert_eq!(restored.hook_entry, initial.hook_entry);
        assert_eq!(restored.underflow, initial.underflow);
        assert_eq!(restored.size, initial.size);
    }

    #[test]
    fn test_add_delete_chain_roundtrip() {
        let mut table = filter_table();
        let initial = table.blob();

        table.add_chain("portal-check").unwrap();
        table.check_consistency();
        assert_eq!(table.num_entries(), 6);

        table.delete_chain("portal-check").unwrap();
        table.check_consistency();
        assert_eq!(table.blob().entries, initial.entries);
    }

    #[test]
    fn test_jump_to_user_chain_tracks_insertions() {
        let mut table = filter_table();
        table.add_chain("guard").unwrap();

        // Jump from INPUT into the user chain.
        let jump = RuleSpec {
            ip: IpSelector::default(),
            target: "guard".to_string(),
            matches: Vec::new(),
        };
        table.append_rule("INPUT", &jump, &EmptyRegistry).unwrap();
        table.check_consistency();

        // Growing a chain before the target shifts the recorded verdict.
        table
            .insert_rule("INPUT", &drop_from("10.0.0.2"), &EmptyRegistry)
            .unwrap();
        table.check_consistency();

        table
            .append_rule("guard", &drop_from("10.9.9.9"), &EmptyRegistry)
            .unwrap();
        table.check_consistency();
    }

    #[test]
    fn test_flush_builtin_chain_restores_cursors() {
        let mut table = filter_table();
        let initial = table.blob();

        table
            .append_rule("FORWARD", &drop_from("10.1.0.1"), &EmptyRegistry)
            .unwrap();
        table
            .append_rule("FORWARD", &drop_from("10.1.0.2"), &EmptyRegistry)
            .unwrap();
        table.check_consistency();

        table.flush_chain("FORWARD").unwrap();
        table.check_consistency();

        let restored = table.blob();
        assert_eq!(restored.entries, initial.entries);
        assert_eq!(restored.hook_entry, initial.hook_entry);
        assert_eq!(restored.underflow, initial.underflow);
    }

    #[test]
    fn test_change_policy() {
        let mut table = filter_table();
        table.change_policy("INPUT", "DROP").unwrap();
        table.check_consistency();

        assert!(table.change_policy("INPUT", "no-such-verdict").is_err());
        assert!(table.change_policy("missing", "DROP").is_err());
    }

    #[test]
    fn test_delete_missing_rule_fails() {
        let mut table = filter_table();
        let err = table
            .delete_rule("INPUT", &drop_from("10.3.0.1"), &EmptyRegistry)
            .unwrap_err();
        assert!(matches!(err, ConnError::NotFound(_)));
    }

    #[test]
    fn test_nat_masquerade_append() {
        let (info, blob) = nat_fixture();
        let mut table = Table::from_kernel(&info, &blob).unwrap();
        table.check_consistency();

        let spec = RuleSpec {
            ip: IpSelector {
                out_iface: Some("wlan0".to_string()),
                ..Default::default()
            },
            target: "MASQUERADE".to_string(),
            matches: Vec::new(),
        };
        table.append_rule("POSTROUTING", &spec, &EmptyRegistry).unwrap();
        table.check_consistency();

        table.flush_chain("POSTROUTING").unwrap();
        table.check_consistency();
    }
}
