//! Packet-filter engine providers.
//!
//! The supervisor emits rules through these traits. The command
//! provider drives the host `iptables`/`ipset` binaries; the memory
//! provider records everything for tests and dry runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the rule engine.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The engine binary could not be executed.
    #[error("failed to run {program}: {reason}")]
    Exec {
        /// Program name.
        program: &'static str,
        /// Failure description.
        reason: String,
    },

    /// The engine rejected the command.
    #[error("{program} rejected command: {stderr}")]
    Rejected {
        /// Program name.
        program: &'static str,
        /// Engine diagnostics.
        stderr: String,
    },

    /// A referenced chain does not exist.
    #[error("no such chain {chain} in table {table}")]
    NoSuchChain {
        /// Table name.
        table: String,
        /// Chain name.
        chain: String,
    },

    /// A rule to delete was not found.
    #[error("no such rule in {table}/{chain}")]
    NoSuchRule {
        /// Table name.
        table: String,
        /// Chain name.
        chain: String,
    },

    /// A referenced set does not exist.
    #[error("no such set {set}")]
    NoSuchSet {
        /// Set name.
        set: String,
    },
}

/// Rule-engine surface: named chains in named tables.
pub trait RuleProvider: Send + Sync {
    /// Appends a rule to a chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the engine rejects the command.
    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError>;

    /// Inserts a rule at `position` (1-based).
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the engine rejects the command.
    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), ProviderError>;

    /// Deletes a rule matching exactly.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the rule is absent.
    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError>;

    /// Creates a chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the chain cannot be created.
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;

    /// Removes every rule from a chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the chain is absent.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;

    /// Deletes an empty chain.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the chain is absent or non-empty.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;

    /// Lists chains in a table.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the table cannot be listed.
    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError>;
}

/// Named-set surface.
pub trait SetProvider: Send + Sync {
    /// Creates a set of the given type if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the set cannot be created.
    fn create_set(&self, set: &str, set_type: &str) -> Result<(), ProviderError>;

    /// Adds an entry, idempotently.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the set is absent.
    fn add_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError>;

    /// Removes an entry.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the set is absent.
    fn del_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError>;

    /// Removes every entry of a set.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the set is absent.
    fn flush_set(&self, set: &str) -> Result<(), ProviderError>;

    /// Destroys a set.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the set is absent or in use.
    fn destroy_set(&self, set: &str) -> Result<(), ProviderError>;

    /// Destroys every set owned by this agent.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the engine rejects the command.
    fn destroy_all(&self) -> Result<(), ProviderError>;
}

/// Provider driving the host `iptables` and `ipset` binaries.
pub struct CommandProvider;

impl CommandProvider {
    fn run(program: &'static str, args: &[&str]) -> Result<String, ProviderError> {
        debug!(program, ?args, "rule engine command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProviderError::Exec {
                program,
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProviderError::Rejected {
                program,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn iptables(args: Vec<&str>) -> Result<(), ProviderError> {
        Self::run("iptables", &args).map(|_| ())
    }
}

impl RuleProvider for CommandProvider {
    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError> {
        let mut args = vec!["-t", table, "-A", chain];
        args.extend(rule.iter().map(String::as_str));
        Self::iptables(args)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), ProviderError> {
        let position = position.to_string();
        let mut args = vec!["-t", table, "-I", chain, &position];
        args.extend(rule.iter().map(String::as_str));
        Self::iptables(args)
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError> {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend(rule.iter().map(String::as_str));
        Self::iptables(args)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        Self::iptables(vec!["-t", table, "-N", chain])
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        Self::iptables(vec!["-t", table, "-F", chain])
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        Self::iptables(vec!["-t", table, "-X", chain])
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        let output = Self::run("iptables", &["-t", table, "-S"])?;
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(|chain| chain.trim().to_string())
            .collect())
    }
}

impl SetProvider for CommandProvider {
    fn create_set(&self, set: &str, set_type: &str) -> Result<(), ProviderError> {
        Self::run("ipset", &["create", set, set_type, "-exist"]).map(|_| ())
    }

    fn add_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError> {
        Self::run("ipset", &["add", set, entry, "-exist"]).map(|_| ())
    }

    fn del_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError> {
        Self::run("ipset", &["del", set, entry]).map(|_| ())
    }

    fn flush_set(&self, set: &str) -> Result<(), ProviderError> {
        Self::run("ipset", &["flush", set]).map(|_| ())
    }

    fn destroy_set(&self, set: &str) -> Result<(), ProviderError> {
        Self::run("ipset", &["destroy", set]).map(|_| ())
    }

    fn destroy_all(&self) -> Result<(), ProviderError> {
        Self::run("ipset", &["destroy"]).map(|_| ())
    }
}

#[derive(Default)]
struct MemoryState {
    chains: HashSet<(String, String)>,
    rules: HashMap<(String, String), Vec<Vec<String>>>,
    sets: HashMap<String, (String, BTreeSet<String>)>,
}

/// In-memory provider recording every mutation.
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Rules currently in `table`/`chain`.
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.locked()
            .rules
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Chains currently present in `table`.
    #[must_use]
    pub fn chains(&self, table: &str) -> Vec<String> {
        let mut chains: Vec<_> = self
            .locked()
            .chains
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, c)| c.clone())
            .collect();
        chains.sort();
        chains
    }

    /// Entries of a named set, if it exists.
    #[must_use]
    pub fn set_entries(&self, set: &str) -> Option<Vec<String>> {
        self.locked()
            .sets
            .get(set)
            .map(|(_, entries)| entries.iter().cloned().collect())
    }

    /// Names of all live sets.
    #[must_use]
    pub fn set_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.locked().sets.keys().cloned().collect();
        names.sort();
        names
    }

    /// All rules, across every table and chain, that mention `needle`.
    #[must_use]
    pub fn rules_mentioning(&self, needle: &str) -> Vec<Vec<String>> {
        self.locked()
            .rules
            .values()
            .flatten()
            .filter(|rule| rule.iter().any(|arg| arg.contains(needle)))
            .cloned()
            .collect()
    }
}

impl RuleProvider for MemoryProvider {
    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError> {
        let mut state = self.locked();
        let key = (table.to_string(), chain.to_string());
        if !state.chains.contains(&key) && !is_builtin_chain(chain) {
            return Err(ProviderError::NoSuchChain {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        state.rules.entry(key).or_default().push(rule.to_vec());
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.locked();
        let key = (table.to_string(), chain.to_string());
        if !state.chains.contains(&key) && !is_builtin_chain(chain) {
            return Err(ProviderError::NoSuchChain {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        let rules = state.rules.entry(key).or_default();
        let index = (position.saturating_sub(1) as usize).min(rules.len());
        rules.insert(index, rule.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), ProviderError> {
        let mut state = self.locked();
        let key = (table.to_string(), chain.to_string());
        let rules = state.rules.get_mut(&key).ok_or(ProviderError::NoSuchRule {
            table: table.to_string(),
            chain: chain.to_string(),
        })?;
        let index = rules.iter().position(|r| r == rule).ok_or(ProviderError::NoSuchRule {
            table: table.to_string(),
            chain: chain.to_string(),
        })?;
        rules.remove(index);
        Ok(())
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let mut state = self.locked();
        state
            .chains
            .insert((table.to_string(), chain.to_string()));
        Ok(())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let mut state = self.locked();
        let key = (table.to_string(), chain.to_string());
        if !state.chains.contains(&key) && !is_builtin_chain(chain) {
            return Err(ProviderError::NoSuchChain {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        state.rules.remove(&key);
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let mut state = self.locked();
        let key = (table.to_string(), chain.to_string());
        if !state.chains.remove(&key) {
            return Err(ProviderError::NoSuchChain {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        state.rules.remove(&key);
        Ok(())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.chains(table))
    }
}

impl SetProvider for MemoryProvider {
    fn create_set(&self, set: &str, set_type: &str) -> Result<(), ProviderError> {
        self.locked()
            .sets
            .entry(set.to_string())
            .or_insert_with(|| (set_type.to_string(), BTreeSet::new()));
        Ok(())
    }

    fn add_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError> {
        self.locked()
            .sets
            .get_mut(set)
            .ok_or_else(|| ProviderError::NoSuchSet {
                set: set.to_string(),
            })?
            .1
            .insert(entry.to_string());
        Ok(())
    }

    fn del_entry(&self, set: &str, entry: &str) -> Result<(), ProviderError> {
        self.locked()
            .sets
            .get_mut(set)
            .ok_or_else(|| ProviderError::NoSuchSet {
                set: set.to_string(),
            })?
            .1
            .remove(entry);
        Ok(())
    }

    fn flush_set(&self, set: &str) -> Result<(), ProviderError> {
        self.locked()
            .sets
            .get_mut(set)
            .ok_or_else(|| ProviderError::NoSuchSet {
                set: set.to_string(),
            })?
            .1
            .clear();
        Ok(())
    }

    fn destroy_set(&self, set: &str) -> Result<(), ProviderError> {
        self.locked()
            .sets
            .remove(set)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NoSuchSet {
                set: set.to_string(),
            })
    }

    fn destroy_all(&self) -> Result<(), ProviderError> {
        self.locked().sets.clear();
        Ok(())
    }
}

fn is_builtin_chain(chain: &str) -> bool {
    matches!(
        chain,
        "INPUT" | "OUTPUT" | "FORWARD" | "PREROUTING" | "POSTROUTING"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_memory_provider_chain_lifecycle() {
        let provider = MemoryProvider::new();

        provider.new_chain("mangle", "TEST-1").unwrap();
        provider
            .append("mangle", "TEST-1", &rule(&["-j", "ACCEPT"]))
            .unwrap();
        assert_eq!(provider.rules("mangle", "TEST-1").len(), 1);

        provider.clear_chain("mangle", "TEST-1").unwrap();
        assert!(provider.rules("mangle", "TEST-1").is_empty());

        provider.delete_chain("mangle", "TEST-1").unwrap();
        assert!(matches!(
            provider.append("mangle", "TEST-1", &rule(&["-j", "DROP"])),
            Err(ProviderError::NoSuchChain { .. })
        ));
    }

    #[test]
    fn test_memory_provider_insert_positions() {
        let provider = MemoryProvider::new();
        provider.new_chain("mangle", "TEST-1").unwrap();

        provider
            .append("mangle", "TEST-1", &rule(&["-j", "A"]))
            .unwrap();
        provider
            .insert("mangle", "TEST-1", 1, &rule(&["-j", "B"]))
            .unwrap();

        let rules = provider.rules("mangle", "TEST-1");
        assert_eq!(rules[0], rule(&["-j", "B"]));
        assert_eq!(rules[1], rule(&["-j", "A"]));
    }

    #[test]
    fn test_memory_provider_delete_requires_exact_match() {
        let provider = MemoryProvider::new();
        provider.new_chain("mangle", "TEST-1").unwrap();
        provider
            .append("mangle", "TEST-1", &rule(&["-j", "ACCEPT"]))
            .unwrap();

        assert!(matches!(
            provider.delete("mangle", "TEST-1", &rule(&["-j", "DROP"])),
            Err(ProviderError::NoSuchRule { .. })
        ));
        provider
            .delete("mangle", "TEST-1", &rule(&["-j", "ACCEPT"]))
            .unwrap();
    }

    #[test]
    fn test_builtin_chains_accept_rules_without_creation() {
        let provider = MemoryProvider::new();
        provider
            .append("mangle", "OUTPUT", &rule(&["-j", "ACCEPT"]))
            .unwrap();
        assert_eq!(provider.rules("mangle", "OUTPUT").len(), 1);
    }

    #[test]
    fn test_set_lifecycle() {
        let provider = MemoryProvider::new();

        provider.create_set("TargetNetSet", "hash:net").unwrap();
        provider.add_entry("TargetNetSet", "10.0.0.0/8").unwrap();
        provider.add_entry("TargetNetSet", "10.0.0.0/8").unwrap();

        assert_eq!(
            provider.set_entries("TargetNetSet").unwrap(),
            vec!["10.0.0.0/8".to_string()]
        );

        provider.flush_set("TargetNetSet").unwrap();
        assert!(provider.set_entries("TargetNetSet").unwrap().is_empty());

        provider.destroy_set("TargetNetSet").unwrap();
        assert!(provider.set_entries("TargetNetSet").is_none());
        assert!(matches!(
            provider.add_entry("TargetNetSet", "10.0.0.0/8"),
            Err(ProviderError::NoSuchSet { .. })
        ));
    }
}
