//! Per-machine packet-filter chains.
//!
//! Each machine owns a named chain in the `inet castellan` nftables table.
//! The chain is identity-bound: rules survive stop/start, and only
//! `remove_vm_chain` (the destroy path) deletes it. Jump rules in the
//! `forward` hook connect a machine's TAP traffic to its chain and are the
//! only piece detached on stop. During rollback the chain must be removed
//! before the TAP is destroyed: the jump rules reference the TAP by name
//! and deleting a still-referenced device yields `device busy`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{FirewallRule, RuleAction, RuleDirection};
use crate::core::runner::{SystemRunner, expect_success};
use crate::error::{Error, Result};

const TABLE: &str = "castellan";
const FORWARD_CHAIN: &str = "forward";
const CHAIN_PREFIX: &str = "vm-";

/// Result of [`FirewallManager::apply_rules_if_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulesOutcome {
    pub changed: bool,
}

/// Manages nftables chains and rules for machines.
pub struct FirewallManager {
    runner: Arc<dyn SystemRunner>,
    applied: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for FirewallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallManager").finish()
    }
}

impl FirewallManager {
    pub fn new(runner: Arc<dyn SystemRunner>) -> Self {
        Self {
            runner,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Chain name owned by a machine.
    pub fn chain_name_for(vm_id: &str) -> String {
        let mut name = String::from(CHAIN_PREFIX);
        for ch in vm_id.chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                name.push(ch.to_ascii_lowercase());
            }
        }
        name
    }

    /// Create the machine's chain if it does not exist yet. Idempotent.
    pub fn ensure_vm_chain(&self, vm_id: &str) -> Result<String> {
        self.ensure_table()?;
        let chain = Self::chain_name_for(vm_id);
        if !self.chain_exists(&chain) {
            self.run(&["add", "chain", "inet", TABLE, &chain])?;
        }
        Ok(chain)
    }

    /// Connect the TAP's ingress and egress to the machine's chain.
    /// Re-attaching replaces any previous jump rules for the machine.
    pub fn attach_jump_rules(&self, vm_id: &str, tap: &str) -> Result<()> {
        self.detach_jump_rules(vm_id)?;
        let chain = Self::chain_name_for(vm_id);
        self.run(&[
            "add", "rule", "inet", TABLE, FORWARD_CHAIN, "iifname", tap, "jump", &chain,
        ])?;
        self.run(&[
            "add", "rule", "inet", TABLE, FORWARD_CHAIN, "oifname", tap, "jump", &chain,
        ])?;
        Ok(())
    }

    /// Remove the machine's jump rules from the forward hook, preserving
    /// the chain and its rules. Idempotent; a missing table is a no-op.
    pub fn detach_jump_rules(&self, vm_id: &str) -> Result<()> {
        let chain = Self::chain_name_for(vm_id);
        let listing = match self.capture(&["-a", "list", "chain", "inet", TABLE, FORWARD_CHAIN]) {
            Ok(listing) => listing,
            Err(_) => return Ok(()),
        };
        for handle in parse_jump_handles(&listing, &chain) {
            self.run(&[
                "delete",
                "rule",
                "inet",
                TABLE,
                FORWARD_CHAIN,
                "handle",
                &handle.to_string(),
            ])?;
        }
        Ok(())
    }

    /// Replace the machine chain's contents with the merged rule list:
    /// department rules first, then machine rules, each group stably
    /// ordered by ascending priority.
    pub fn apply_rules(
        &self,
        vm_id: &str,
        tap: &str,
        dept_rules: &[FirewallRule],
        vm_rules: &[FirewallRule],
    ) -> Result<()> {
        let chain = self.ensure_vm_chain(vm_id)?;
        self.run(&["flush", "chain", "inet", TABLE, &chain])?;
        for rule in merge_rules(dept_rules, vm_rules) {
            let rendered = render_rule(&rule, tap);
            let mut args = vec!["add", "rule", "inet", TABLE, chain.as_str()];
            args.extend(rendered.iter().map(String::as_str));
            self.run(&args)?;
        }
        if let Ok(mut applied) = self.applied.lock() {
            applied.insert(vm_id.to_string(), rules_digest(dept_rules, vm_rules, tap));
        }
        Ok(())
    }

    /// Apply the rule list only when its content hash differs from the
    /// last applied one for this machine.
    pub fn apply_rules_if_changed(
        &self,
        vm_id: &str,
        tap: &str,
        dept_rules: &[FirewallRule],
        vm_rules: &[FirewallRule],
    ) -> Result<RulesOutcome> {
        let digest = rules_digest(dept_rules, vm_rules, tap);
        let unchanged = self
            .applied
            .lock()
            .map(|applied| applied.get(vm_id) == Some(&digest))
            .unwrap_or(false);
        if unchanged {
            debug!(vm_id, "firewall rules unchanged, skipping re-apply");
            return Ok(RulesOutcome { changed: false });
        }
        self.apply_rules(vm_id, tap, dept_rules, vm_rules)?;
        Ok(RulesOutcome { changed: true })
    }

    /// Permanently remove the machine's chain and its jump rules. Used by
    /// destroy and rollback only.
    pub fn remove_vm_chain(&self, vm_id: &str) -> Result<()> {
        self.detach_jump_rules(vm_id)?;
        let chain = Self::chain_name_for(vm_id);
        if !self.chain_exists(&chain) {
            return Ok(());
        }
        self.run(&["flush", "chain", "inet", TABLE, &chain])?;
        self.run(&["delete", "chain", "inet", TABLE, &chain])?;
        if let Ok(mut applied) = self.applied.lock() {
            applied.remove(vm_id);
        }
        Ok(())
    }

    fn ensure_table(&self) -> Result<()> {
        // `add table` is idempotent in nft.
        self.run(&["add", "table", "inet", TABLE])?;
        if !self.chain_exists(FORWARD_CHAIN) {
            self.run(&[
                "add", "chain", "inet", TABLE, FORWARD_CHAIN, "{", "type", "filter", "hook",
                "forward", "priority", "0", ";", "policy", "accept", ";", "}",
            ])?;
        }
        Ok(())
    }

    fn chain_exists(&self, chain: &str) -> bool {
        self.capture(&["list", "chain", "inet", TABLE, chain]).is_ok()
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = self
            .runner
            .run("nft", args)
            .map_err(|err| Error::NetworkError {
                message: format!("failed to spawn nft: {err}"),
                diagnostics: Vec::new(),
            })?;
        expect_success("nft", args, &output).map_err(|message| Error::NetworkError {
            message,
            diagnostics: Vec::new(),
        })
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        let output = self
            .runner
            .run("nft", args)
            .map_err(|err| Error::NetworkError {
                message: format!("failed to spawn nft: {err}"),
                diagnostics: Vec::new(),
            })?;
        if !output.status.success() {
            return Err(Error::NetworkError {
                message: format!(
                    "nft {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                diagnostics: Vec::new(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Merge department and machine rules for application order.
fn merge_rules(dept_rules: &[FirewallRule], vm_rules: &[FirewallRule]) -> Vec<FirewallRule> {
    let mut dept: Vec<FirewallRule> = dept_rules.to_vec();
    dept.sort_by_key(|rule| rule.priority);
    let mut specific: Vec<FirewallRule> = vm_rules.to_vec();
    specific.sort_by_key(|rule| rule.priority);
    dept.extend(specific);
    dept
}

/// Render one rule into nft tokens for the machine's chain.
///
/// Direction is relative to the guest: `In` matches traffic leaving the
/// host toward the TAP, `Out` matches traffic arriving from it. `InOut`
/// carries no interface qualifier; the chain is only reachable through
/// this machine's jump rules anyway.
fn render_rule(rule: &FirewallRule, tap: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    match rule.direction {
        RuleDirection::In => {
            tokens.push("oifname".to_string());
            tokens.push(tap.to_string());
        }
        RuleDirection::Out => {
            tokens.push("iifname".to_string());
            tokens.push(tap.to_string());
        }
        RuleDirection::InOut => {}
    }

    if let Some(net) = &rule.src_net {
        tokens.push(ip_keyword(net.addr).to_string());
        tokens.push("saddr".to_string());
        tokens.push(format!("{}/{}", net.addr, net.prefix));
    }
    if let Some(net) = &rule.dst_net {
        tokens.push(ip_keyword(net.addr).to_string());
        tokens.push("daddr".to_string());
        tokens.push(format!("{}/{}", net.addr, net.prefix));
    }

    match (&rule.protocol, &rule.src_ports, &rule.dst_ports) {
        (Some(protocol), src, dst) => {
            if src.is_none() && dst.is_none() {
                tokens.push("meta".to_string());
                tokens.push("l4proto".to_string());
                tokens.push(protocol.clone());
            } else {
                if let Some(range) = src {
                    tokens.push(protocol.clone());
                    tokens.push("sport".to_string());
                    tokens.push(render_range(range));
                }
                if let Some(range) = dst {
                    tokens.push(protocol.clone());
                    tokens.push("dport".to_string());
                    tokens.push(render_range(range));
                }
            }
        }
        (None, _, _) => {}
    }

    if !rule.conn_states.is_empty() {
        tokens.push("ct".to_string());
        tokens.push("state".to_string());
        tokens.push(rule.conn_states.join(","));
    }

    tokens.push(
        match rule.action {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
            RuleAction::Reject => "reject",
        }
        .to_string(),
    );
    tokens
}

fn render_range(range: &crate::config::PortRange) -> String {
    if range.start == range.end {
        range.start.to_string()
    } else {
        format!("{}-{}", range.start, range.end)
    }
}

fn ip_keyword(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}

/// Content hash of the effective ruleset for one machine.
fn rules_digest(dept_rules: &[FirewallRule], vm_rules: &[FirewallRule], tap: &str) -> String {
    let mut hasher = Sha256::new();
    for rule in merge_rules(dept_rules, vm_rules) {
        hasher.update(render_rule(&rule, tap).join(" ").as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Extract the rule handles of jump rules targeting `chain` from an
/// `nft -a list chain` dump.
fn parse_jump_handles(listing: &str, chain: &str) -> Vec<u64> {
    let needle = format!("jump {chain}");
    let mut handles = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if !line.contains(&needle) {
            continue;
        }
        // Guard against `vm-a` matching inside `vm-ab`.
        let after = &line[line.find(&needle).map(|idx| idx + needle.len()).unwrap_or(0)..];
        if after
            .chars()
            .next()
            .map(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
            .unwrap_or(false)
        {
            continue;
        }
        if let Some(raw) = line.rsplit("# handle ").next() {
            if let Ok(handle) = raw.trim().parse::<u64>() {
                handles.push(handle);
            }
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use crate::config::{IpNet, PortRange};
    use crate::core::net::test_support::RecordingRunner;

    use super::*;

    fn rule(id: &str, priority: i32) -> FirewallRule {
        FirewallRule {
            id: id.to_string(),
            name: id.to_string(),
            action: RuleAction::Accept,
            direction: RuleDirection::In,
            priority,
            protocol: Some("tcp".to_string()),
            src_ports: None,
            dst_ports: Some(PortRange { start: 22, end: 22 }),
            src_net: None,
            dst_net: None,
            conn_states: Vec::new(),
            overrides_dept: false,
        }
    }

    #[test]
    fn chain_names_are_sanitized() {
        assert_eq!(FirewallManager::chain_name_for("v1"), "vm-v1");
        assert_eq!(FirewallManager::chain_name_for("A b/c"), "vm-abc");
    }

    #[test]
    fn render_covers_direction_and_matches() {
        let mut sample = rule("r1", 10);
        sample.src_net = Some(IpNet {
            addr: Ipv4Addr::new(10, 0, 0, 0).into(),
            prefix: 8,
        });
        sample.conn_states = vec!["established".to_string(), "related".to_string()];
        assert_eq!(
            render_rule(&sample, "vnet-v1").join(" "),
            "oifname vnet-v1 ip saddr 10.0.0.0/8 tcp dport 22 ct state established,related accept"
        );

        let mut outbound = rule("r2", 10);
        outbound.direction = RuleDirection::Out;
        outbound.action = RuleAction::Drop;
        outbound.dst_ports = Some(PortRange {
            start: 8000,
            end: 8100,
        });
        assert_eq!(
            render_rule(&outbound, "vnet-v1").join(" "),
            "iifname vnet-v1 tcp dport 8000-8100 drop"
        );

        let mut bare = rule("r3", 10);
        bare.direction = RuleDirection::InOut;
        bare.dst_ports = None;
        assert_eq!(render_rule(&bare, "vnet-v1").join(" "), "meta l4proto tcp accept");
    }

    #[test]
    fn merge_orders_department_first_then_priority() {
        let dept = vec![rule("d-50", 50), rule("d-10", 10)];
        let vm = vec![rule("m-40", 40), rule("m-5", 5)];
        let ids: Vec<String> = merge_rules(&dept, &vm)
            .into_iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(ids, ["d-10", "d-50", "m-5", "m-40"]);
    }

    #[test]
    fn ensure_vm_chain_is_idempotent() {
        let runner = Arc::new(RecordingRunner::new());
        // The chain does not exist on the first probe; report it present
        // afterwards so the second ensure only lists.
        let manager = FirewallManager::new(Arc::clone(&runner) as Arc<dyn SystemRunner>);
        runner.fail_when("list chain inet castellan vm-v1", "No such file or directory");
        manager.ensure_vm_chain("v1").expect("first ensure");

        let adds_before = count_adds(&runner);
        // Chain now "exists": clear the canned failure.
        runner.failures.lock().expect("failures").clear();
        manager.ensure_vm_chain("v1").expect("second ensure");
        assert_eq!(
            count_adds(&runner),
            adds_before,
            "second ensure must not add anything"
        );
    }

    fn count_adds(runner: &RecordingRunner) -> usize {
        // `add table` is idempotent in nft and runs on every ensure; only
        // chain and rule additions mutate observable per-VM state.
        runner
            .calls()
            .iter()
            .filter(|call| call.contains("add chain") || call.contains("add rule"))
            .count()
    }

    #[test]
    fn attach_then_detach_removes_exactly_the_jump_rules() {
        let runner = Arc::new(RecordingRunner::new());
        let manager = FirewallManager::new(Arc::clone(&runner) as Arc<dyn SystemRunner>);
        manager.attach_jump_rules("v1", "vnet-v1").expect("attach");

        let calls = runner.calls();
        assert!(calls.iter().any(|call| call
            .contains("add rule inet castellan forward iifname vnet-v1 jump vm-v1")));
        assert!(calls.iter().any(|call| call
            .contains("add rule inet castellan forward oifname vnet-v1 jump vm-v1")));

        runner.respond_when(
            "-a list chain inet castellan forward",
            "table inet castellan {\n chain forward {\n  iifname \"vnet-v1\" jump vm-v1 # handle 11\n  oifname \"vnet-v1\" jump vm-v1 # handle 12\n  iifname \"vnet-v2\" jump vm-v2 # handle 13\n }\n}\n",
        );
        manager.detach_jump_rules("v1").expect("detach");
        let calls = runner.calls();
        assert!(calls
            .iter()
            .any(|call| call == "nft delete rule inet castellan forward handle 11"));
        assert!(calls
            .iter()
            .any(|call| call == "nft delete rule inet castellan forward handle 12"));
        assert!(
            !calls
                .iter()
                .any(|call| call.contains("handle 13")),
            "other machines' jump rules must be untouched"
        );
    }

    #[test]
    fn jump_handle_parsing_is_exact() {
        let listing = "\
table inet castellan {
  chain forward {
    iifname \"vnet-a\" jump vm-a # handle 7
    iifname \"vnet-ab\" jump vm-ab # handle 8
  }
}";
        assert_eq!(parse_jump_handles(listing, "vm-a"), vec![7]);
        assert_eq!(parse_jump_handles(listing, "vm-ab"), vec![8]);
        assert!(parse_jump_handles(listing, "vm-c").is_empty());
    }

    #[test]
    fn apply_rules_if_changed_hashes_content() {
        let runner = Arc::new(RecordingRunner::new());
        let manager = FirewallManager::new(Arc::clone(&runner) as Arc<dyn SystemRunner>);
        let dept = vec![rule("d1", 10)];
        let vm = vec![rule("m1", 20)];

        let first = manager
            .apply_rules_if_changed("v1", "vnet-v1", &dept, &vm)
            .expect("first apply");
        assert!(first.changed);
        let second = manager
            .apply_rules_if_changed("v1", "vnet-v1", &dept, &vm)
            .expect("second apply");
        assert!(!second.changed);

        let mut updated = vm.clone();
        updated[0].dst_ports = Some(PortRange { start: 80, end: 80 });
        let third = manager
            .apply_rules_if_changed("v1", "vnet-v1", &dept, &updated)
            .expect("third apply");
        assert!(third.changed);
    }

    #[test]
    fn remove_vm_chain_tolerates_missing_chain() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_when("list chain", "No such file or directory");
        let manager = FirewallManager::new(runner);
        manager.remove_vm_chain("v1").expect("missing chain is ok");
    }
}
