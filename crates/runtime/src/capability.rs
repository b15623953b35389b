use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A group of functions exposed to sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// `tostring`, `tonumber`, `type`, `pairs`, `ipairs`, `next`, `select`,
    /// `error`, `assert`, `pcall`, `rawequal`, `rawlen`, `setmetatable`.
    Core,
    /// The `math` table.
    Math,
    /// The `string` and `utf8` tables (without `string.dump`).
    Text,
    /// The `table` table.
    Collections,
    /// `json.encode` / `json.decode`.
    Json,
    /// Captured `print`.
    Output,
    /// `read_file`, `write_file`, `list_files` confined to the working directory.
    Files,
    /// `llm_query` / `llm_query_batched`.
    Query,
    /// `show_vars` / `final_var`.
    Introspection,
}

impl Capability {
    /// Global names this capability installs.
    pub fn globals(self) -> &'static [&'static str] {
        match self {
            Capability::Core => &[
                "tostring",
                "tonumber",
                "type",
                "pairs",
                "ipairs",
                "next",
                "select",
                "error",
                "assert",
                "pcall",
                "rawequal",
                "rawlen",
                "setmetatable",
            ],
            Capability::Math => &["math"],
            Capability::Text => &["string", "utf8"],
            Capability::Collections => &["table"],
            Capability::Json => &["json"],
            Capability::Output => &["print"],
            Capability::Files => &["read_file", "write_file", "list_files"],
            Capability::Query => &["llm_query", "llm_query_batched"],
            Capability::Introspection => &["show_vars", "final_var"],
        }
    }
}

/// The enumerated set of operations sandboxed code may perform.
///
/// Anything not in the set does not exist inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    enabled: BTreeSet<Capability>,
    workdir: Option<PathBuf>,
}

impl CapabilitySet {
    /// Everything except file access.
    pub fn standard() -> Self {
        Self {
            enabled: [
                Capability::Core,
                Capability::Math,
                Capability::Text,
                Capability::Collections,
                Capability::Json,
                Capability::Output,
                Capability::Query,
                Capability::Introspection,
            ]
            .into_iter()
            .collect(),
            workdir: None,
        }
    }

    /// An empty set. Code can still compute with literals and operators.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
            workdir: None,
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        if capability != Capability::Files {
            self.enabled.insert(capability);
        }
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.enabled.remove(&capability);
        if capability == Capability::Files {
            self.workdir = None;
        }
        self
    }

    /// Enable file access confined to `workdir`.
    pub fn with_files(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.enabled.insert(Capability::Files);
        self.workdir = Some(workdir.into());
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.enabled.iter().copied()
    }

    /// Every global name installed by the enabled capabilities.
    pub fn reserved_names(&self) -> BTreeSet<&'static str> {
        self.iter().flat_map(|c| c.globals().iter().copied()).collect()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_excludes_files() {
        let caps = CapabilitySet::standard();
        assert!(caps.allows(Capability::Query));
        assert!(!caps.allows(Capability::Files));
        assert!(caps.workdir().is_none());
    }

    #[test]
    fn test_files_require_workdir() {
        let caps = CapabilitySet::none().with(Capability::Files);
        assert!(!caps.allows(Capability::Files));

        let caps = CapabilitySet::none().with_files("/tmp/work");
        assert!(caps.allows(Capability::Files));
        assert_eq!(caps.workdir(), Some(Path::new("/tmp/work")));

        let caps = caps.without(Capability::Files);
        assert!(caps.workdir().is_none());
    }

    #[test]
    fn test_reserved_names() {
        let names = CapabilitySet::standard().reserved_names();
        assert!(names.contains("llm_query"));
        assert!(names.contains("print"));
        assert!(!names.contains("read_file"));
        assert!(!names.contains("load"));
    }
}
