//! Tunables for arenas, parsing and serialization.
//!
//! With the `serde_support` feature these load from configuration files; any
//! key left out keeps its default.

/// Default cap on message nesting for both directions.
pub const DEFAULT_MAX_DEPTH: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct ArenaConfig {
    /// Size of the first block requested from the block allocator.
    pub initial_block_size: usize,
    /// Upper bound for geometric block growth. Larger requests still succeed
    /// with a block of their own.
    pub max_block_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            initial_block_size: 256,
            max_block_size: 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct DecodeOptions {
    /// Fail with a missing-required status when a required field is absent.
    pub check_required: bool,
    /// Keep payloads of sub-messages whose mini-table is not linked yet as raw
    /// bytes instead of failing.
    pub allow_unlinked: bool,
    /// Drop unknown fields instead of retaining them.
    pub discard_unknown: bool,
    pub max_depth: u32,
    #[cfg_attr(feature = "serde_support", serde(skip))]
    alias_strings: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            check_required: false,
            allow_unlinked: false,
            discard_unknown: false,
            max_depth: DEFAULT_MAX_DEPTH,
            alias_strings: false,
        }
    }
}

impl DecodeOptions {
    pub fn check_required(mut self, yes: bool) -> Self {
        self.check_required = yes;
        self
    }

    pub fn allow_unlinked(mut self, yes: bool) -> Self {
        self.allow_unlinked = yes;
        self
    }

    pub fn discard_unknown(mut self, yes: bool) -> Self {
        self.discard_unknown = yes;
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Lets string and bytes fields point into the input instead of copying.
    ///
    /// # Safety
    ///
    /// The input buffer must stay alive and unmodified for as long as the
    /// decoded message (and its arena group) is in use.
    pub unsafe fn alias_strings(mut self, yes: bool) -> Self {
        self.alias_strings = yes;
        self
    }

    #[inline]
    pub fn aliasing(&self) -> bool {
        self.alias_strings
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct EncodeOptions {
    /// Sort map entries by key so equal messages give equal bytes.
    pub deterministic: bool,
    /// Leave retained unknown fields out of the output.
    pub skip_unknown: bool,
    /// Refuse to serialize a message tree with unset required fields.
    pub check_required: bool,
    pub max_depth: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            deterministic: false,
            skip_unknown: false,
            check_required: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EncodeOptions {
    pub fn deterministic(mut self, yes: bool) -> Self {
        self.deterministic = yes;
        self
    }

    pub fn skip_unknown(mut self, yes: bool) -> Self {
        self.skip_unknown = yes;
        self
    }

    pub fn check_required(mut self, yes: bool) -> Self {
        self.check_required = yes;
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }
}
