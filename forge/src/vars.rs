//! Fastboot variable registry
//!
//! Variables are either static strings or dynamic getters evaluated at
//! read time against the device collaborators. Names and values are
//! bounded to 63 bytes on the wire; a dynamic value over the bound reads
//! as empty with an error log, matching the reply-frame payload budget.

use tracing::error;

use crate::device::Device;
use crate::error::{FastbootError, Result};

/// Maximum length of a variable name or value, excluding the terminator
/// the wire format reserves.
pub const MAX_VARIABLE_LENGTH: usize = 63;

const PARTITION_VAR_PREFIX: &str = "partition-";

/// Getter for a dynamic variable; returns `None` when the value is
/// currently unavailable.
pub type VarGetter = Box<dyn Fn(&mut Device) -> Option<String>>;

pub enum VarEntry {
    Static(String),
    Dynamic(VarGetter),
}

/// Insertion-ordered variable registry keyed by name.
#[derive(Default)]
pub struct VarStore {
    entries: Vec<(String, VarEntry)>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a static variable, replacing any previous entry of the
    /// same name.
    pub fn publish(&mut self, name: &str, value: &str) -> Result<()> {
        if value.len() > MAX_VARIABLE_LENGTH {
            error!("name or value too long for variable '{name}'");
            return Err(FastbootError::InvalidParameter);
        }
        self.insert(name, VarEntry::Static(value.to_string()))
    }

    /// Publish a dynamic variable backed by a getter.
    pub fn publish_dynamic(&mut self, name: &str, getter: VarGetter) -> Result<()> {
        self.insert(name, VarEntry::Dynamic(getter))
    }

    fn insert(&mut self, name: &str, entry: VarEntry) -> Result<()> {
        if name.len() > MAX_VARIABLE_LENGTH {
            error!("Name too long for variable '{name}'");
            return Err(FastbootError::InvalidParameter);
        }
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = entry,
            None => self.entries.push((name.to_string(), entry)),
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&VarEntry> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }

    /// All published names, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the wire value of an entry. Dynamic failures and oversized
    /// values read as empty.
    pub fn value_of(&self, name: &str, device: &mut Device) -> Option<String> {
        let entry = self.lookup(name)?;
        Some(match entry {
            VarEntry::Static(value) => value.clone(),
            VarEntry::Dynamic(getter) => {
                let Some(value) = getter(device) else {
                    return Some(String::new());
                };
                if value.len() > MAX_VARIABLE_LENGTH {
                    error!("value too long for '{name}' variable");
                    return Some(String::new());
                }
                value
            }
        })
    }

    /// Drop every variable whose name starts with `partition-`; used
    /// before re-publishing partition metadata after a GPT change.
    pub fn clean_partition_vars(&mut self) {
        self.entries
            .retain(|(name, _)| !name.starts_with(PARTITION_VAR_PREFIX));
    }

    /// Session teardown: drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{device_with_firmware, MemFirmware};

    #[test]
    fn test_publish_replaces_latest_value() {
        let mut vars = VarStore::new();
        vars.publish("product", "anvil").unwrap();
        vars.publish("product", "hammer").unwrap();
        assert_eq!(vars.len(), 1);

        let mut device = device_with_firmware(MemFirmware::default());
        assert_eq!(vars.value_of("product", &mut device).unwrap(), "hammer");
    }

    #[test]
    fn test_publish_rejects_oversized_name_and_value() {
        let mut vars = VarStore::new();
        let long = "v".repeat(MAX_VARIABLE_LENGTH + 1);
        assert!(vars.publish(&long, "x").is_err());
        assert!(vars.publish("x", &long).is_err());
        assert!(vars.publish(&"n".repeat(MAX_VARIABLE_LENGTH), "ok").is_ok());
    }

    #[test]
    fn test_dynamic_value_bounds() {
        let mut vars = VarStore::new();
        vars.publish_dynamic("huge", Box::new(|_| Some("y".repeat(100))))
            .unwrap();
        vars.publish_dynamic("absent", Box::new(|_| None)).unwrap();

        let mut device = device_with_firmware(MemFirmware::default());
        assert_eq!(vars.value_of("huge", &mut device).unwrap(), "");
        assert_eq!(vars.value_of("absent", &mut device).unwrap(), "");
    }

    #[test]
    fn test_clean_partition_vars_removes_exactly_prefix_set() {
        let mut vars = VarStore::new();
        vars.publish("product", "anvil").unwrap();
        vars.publish("partition-size:boot", "0x1000").unwrap();
        vars.publish("partition-type:boot", "ext4").unwrap();
        vars.publish("has-slot:boot", "no").unwrap();

        vars.clean_partition_vars();

        let names: Vec<_> = vars.names().collect();
        assert_eq!(names, vec!["product", "has-slot:boot"]);
    }
}
