//! Command registry
//!
//! Commands map an exact name to a handler kind and the minimum lock
//! state required to run it. Registration is append-only during session
//! init; sub-command groups (`flashing`, `oem`) nest their own registry
//! and are dispatched through the same lookup path.

use crate::device::LockState;

/// Handler selector, matched in one place by the session.
#[derive(Debug, Clone)]
pub enum CmdKind {
    Download,
    Flash,
    Erase,
    Getvar,
    Boot,
    Continue,
    Reboot,
    RebootBootloader,
    FlashingLock,
    FlashingUnlock,
    FlashingGetUnlockAbility,
    OemGetHashes,
    OemOffModeCharge,
    /// A sub-command group; the first argument selects within it.
    Group(CommandRegistry),
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub min_state: LockState,
    pub kind: CmdKind,
}

impl CommandSpec {
    pub fn new(name: &str, min_state: LockState, kind: CmdKind) -> Self {
        Self {
            name: name.to_string(),
            min_state,
            kind,
        }
    }
}

/// Append-only command collection with exact-match lookup.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.push(spec);
    }

    pub fn find(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// The built-in command tree.
pub fn builtin_registry() -> CommandRegistry {
    use CmdKind::*;
    use LockState::*;

    let mut flashing = CommandRegistry::new();
    flashing.register(CommandSpec::new("lock", Locked, FlashingLock));
    flashing.register(CommandSpec::new("unlock", Locked, FlashingUnlock));
    flashing.register(CommandSpec::new(
        "get_unlock_ability",
        Locked,
        FlashingGetUnlockAbility,
    ));

    let mut oem = CommandRegistry::new();
    oem.register(CommandSpec::new("get-hashes", Locked, OemGetHashes));
    oem.register(CommandSpec::new("off-mode-charge", Unlocked, OemOffModeCharge));

    let mut root = CommandRegistry::new();
    root.register(CommandSpec::new("download", Locked, Download));
    root.register(CommandSpec::new("flash", Locked, Flash));
    root.register(CommandSpec::new("erase", Unlocked, Erase));
    root.register(CommandSpec::new("getvar", Locked, Getvar));
    root.register(CommandSpec::new("boot", Unlocked, Boot));
    root.register(CommandSpec::new("continue", Locked, Continue));
    root.register(CommandSpec::new("reboot", Locked, Reboot));
    root.register(CommandSpec::new("reboot-bootloader", Locked, RebootBootloader));
    root.register(CommandSpec::new("flashing", Locked, Group(flashing)));
    root.register(CommandSpec::new("oem", Locked, Group(oem)));
    root
}
