//! Core hook vocabulary: ids, target descriptors, categories, priorities, states

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier of a registered hook
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookId(String);

impl HookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids must be non-empty and carry no surrounding whitespace
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.trim() == self.0
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HookId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HookId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::borrow::Borrow<str> for HookId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Opaque key identifying the intercepted resource
///
/// Adapters pick the variant that fits their target: exported symbols for
/// module-level functions, address ranges for code located by pattern scans.
///
/// Equality, ordering and hashing ignore ASCII case in module names, so
/// `D3D11.dll!Present` and `d3d11.dll!Present` are the same call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetDescriptor {
    /// Function exported (or otherwise named) inside a module
    Symbol { module: String, function: String },

    /// Raw code range inside the process
    Address { start: usize, len: usize },
}

impl TargetDescriptor {
    pub fn symbol(module: impl Into<String>, function: impl Into<String>) -> Self {
        TargetDescriptor::Symbol {
            module: module.into(),
            function: function.into(),
        }
    }

    pub fn address(start: usize, len: usize) -> Self {
        TargetDescriptor::Address { start, len }
    }

    /// Check the descriptor is well-formed
    pub fn is_valid(&self) -> bool {
        match self {
            TargetDescriptor::Symbol { module, function } => {
                !module.trim().is_empty() && !function.trim().is_empty()
            }
            TargetDescriptor::Address { start, len } => {
                *start != 0 && *len != 0 && start.checked_add(*len).is_some()
            }
        }
    }

    /// Module name, if this is a symbol target
    pub fn module(&self) -> Option<&str> {
        match self {
            TargetDescriptor::Symbol { module, .. } => Some(module),
            TargetDescriptor::Address { .. } => None,
        }
    }

    /// Function name, if this is a symbol target
    pub fn function(&self) -> Option<&str> {
        match self {
            TargetDescriptor::Symbol { function, .. } => Some(function),
            TargetDescriptor::Address { .. } => None,
        }
    }

    /// Whether two descriptors compete for the same call site
    ///
    /// Module names compare case-insensitively. Address ranges overlap when
    /// they share at least one byte. Symbols and addresses never overlap.
    pub fn overlaps(&self, other: &TargetDescriptor) -> bool {
        match (self, other) {
            (
                TargetDescriptor::Symbol { module: m1, function: f1 },
                TargetDescriptor::Symbol { module: m2, function: f2 },
            ) => m1.eq_ignore_ascii_case(m2) && f1 == f2,
            (
                TargetDescriptor::Address { start: s1, len: l1 },
                TargetDescriptor::Address { start: s2, len: l2 },
            ) => {
                let end1 = s1.saturating_add(*l1);
                let end2 = s2.saturating_add(*l2);
                *s1 < end2 && *s2 < end1
            }
            _ => false,
        }
    }
}

fn folded(s: &str) -> impl Iterator<Item = u8> + '_ {
    s.bytes().map(|b| b.to_ascii_lowercase())
}

impl Ord for TargetDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                TargetDescriptor::Symbol { module: m1, function: f1 },
                TargetDescriptor::Symbol { module: m2, function: f2 },
            ) => folded(m1).cmp(folded(m2)).then_with(|| f1.cmp(f2)),
            (
                TargetDescriptor::Address { start: s1, len: l1 },
                TargetDescriptor::Address { start: s2, len: l2 },
            ) => (s1, l1).cmp(&(s2, l2)),
            (TargetDescriptor::Symbol { .. }, TargetDescriptor::Address { .. }) => Ordering::Less,
            (TargetDescriptor::Address { .. }, TargetDescriptor::Symbol { .. }) => {
                Ordering::Greater
            }
        }
    }
}

impl PartialOrd for TargetDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TargetDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TargetDescriptor {}

impl Hash for TargetDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TargetDescriptor::Symbol { module, function } => {
                state.write_u8(0);
                for b in folded(module) {
                    state.write_u8(b);
                }
                state.write_u8(0xff);
                function.hash(state);
            }
            TargetDescriptor::Address { start, len } => {
                state.write_u8(1);
                start.hash(state);
                len.hash(state);
            }
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetDescriptor::Symbol { module, function } => write!(f, "{}!{}", module, function),
            TargetDescriptor::Address { start, len } => write!(f, "{:#x}+{:#x}", start, len),
        }
    }
}

/// Error returned when parsing an enum from its string form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($name) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(ParseEnumError { kind: $kind, value: s.to_string() })
            }
        }
    };
}

/// Functional area a hook belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCategory {
    Rendering,
    Input,
    Lifecycle,
    Engine,
    Audio,
    Physics,
    Network,
    Memory,
    FileSystem,
    Custom,
}

impl Default for HookCategory {
    fn default() -> Self {
        Self::Custom
    }
}

string_enum!(HookCategory, "category", {
    Rendering => "rendering",
    Input => "input",
    Lifecycle => "lifecycle",
    Engine => "engine",
    Audio => "audio",
    Physics => "physics",
    Network => "network",
    Memory => "memory",
    FileSystem => "file_system",
    Custom => "custom",
});

/// Hook priority; higher priorities run earlier in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HookPriority {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
    Critical = 5,
}

impl Default for HookPriority {
    fn default() -> Self {
        Self::Normal
    }
}

string_enum!(HookPriority, "priority", {
    Lowest => "lowest",
    Low => "low",
    Normal => "normal",
    High => "high",
    Highest => "highest",
    Critical => "critical",
});

impl HookPriority {
    /// Convert a raw numeric priority (as used over the C ABI)
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }
}

/// Lifecycle state of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookState {
    Uninstalled,
    Installing,
    Installed,
    Failed,
    Removing,
    Disabled,
}

impl Default for HookState {
    fn default() -> Self {
        Self::Uninstalled
    }
}

string_enum!(HookState, "state", {
    Uninstalled => "uninstalled",
    Installing => "installing",
    Installed => "installed",
    Failed => "failed",
    Removing => "removing",
    Disabled => "disabled",
});

impl HookState {
    /// Whether `self -> next` is an edge of the hook state machine
    pub fn can_transition_to(self, next: HookState) -> bool {
        use HookState::*;
        matches!(
            (self, next),
            (Uninstalled, Installing)
                | (Installing, Installed)
                | (Installing, Failed)
                | (Failed, Installing)
                | (Installed, Removing)
                | (Removing, Uninstalled)
                | (Installed, Disabled)
                | (Disabled, Installed)
        )
    }

    /// Hook currently owns a link in a dispatch chain
    pub fn is_active(self) -> bool {
        matches!(self, HookState::Installed | HookState::Disabled)
    }

    /// Hook may start an installation
    pub fn is_installable(self) -> bool {
        matches!(self, HookState::Uninstalled | HookState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use HookState::*;

        assert!(Uninstalled.can_transition_to(Installing));
        assert!(Installing.can_transition_to(Installed));
        assert!(Installing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Installing));
        assert!(Installed.can_transition_to(Removing));
        assert!(Removing.can_transition_to(Uninstalled));
        assert!(Installed.can_transition_to(Disabled));
        assert!(Disabled.can_transition_to(Installed));

        assert!(!Uninstalled.can_transition_to(Installed));
        assert!(!Disabled.can_transition_to(Removing));
        assert!(!Failed.can_transition_to(Uninstalled));
        assert!(!Removing.can_transition_to(Installed));
    }

    #[test]
    fn test_target_validation() {
        assert!(TargetDescriptor::symbol("d3d11.dll", "Present").is_valid());
        assert!(!TargetDescriptor::symbol("", "Present").is_valid());
        assert!(!TargetDescriptor::symbol("d3d11.dll", "  ").is_valid());
        assert!(TargetDescriptor::address(0x1000, 16).is_valid());
        assert!(!TargetDescriptor::address(0, 16).is_valid());
        assert!(!TargetDescriptor::address(0x1000, 0).is_valid());
        assert!(!TargetDescriptor::address(usize::MAX, 2).is_valid());
    }

    #[test]
    fn test_target_overlap() {
        let a = TargetDescriptor::symbol("D3D11.dll", "Present");
        let b = TargetDescriptor::symbol("d3d11.dll", "Present");
        let c = TargetDescriptor::symbol("d3d11.dll", "ResizeBuffers");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let r1 = TargetDescriptor::address(0x1000, 0x10);
        let r2 = TargetDescriptor::address(0x100f, 0x10);
        let r3 = TargetDescriptor::address(0x1010, 0x10);
        assert!(r1.overlaps(&r2));
        assert!(!r1.overlaps(&r3));
        assert!(!r1.overlaps(&a));
    }

    #[test]
    fn test_module_case_is_ignored_for_identity() {
        use std::collections::HashSet;

        let a = TargetDescriptor::symbol("D3D11.dll", "Present");
        let b = TargetDescriptor::symbol("d3d11.DLL", "Present");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_ne!(a, TargetDescriptor::symbol("d3d11.dll", "present"));

        let set: HashSet<TargetDescriptor> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&TargetDescriptor::symbol("D3d11.Dll", "Present")));

        // Display keeps the spelling the adapter used
        assert_eq!(a.to_string(), "D3D11.dll!Present");
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(HookCategory::FileSystem.as_str(), "file_system");
        assert_eq!("RENDERING".parse::<HookCategory>(), Ok(HookCategory::Rendering));
        assert_eq!("high".parse::<HookPriority>(), Ok(HookPriority::High));
        assert!("urgent".parse::<HookPriority>().is_err());
        assert_eq!(HookPriority::from_u8(5), Some(HookPriority::Critical));
        assert_eq!(HookPriority::from_u8(6), None);
        assert!(HookPriority::Critical > HookPriority::Lowest);
    }

    #[test]
    fn test_hook_id_validation() {
        assert!(HookId::new("present").is_valid());
        assert!(!HookId::new("").is_valid());
        assert!(!HookId::new(" present").is_valid());
    }
}
