//! Engine configuration, received once at open time (spec §6.5).
//!
//! Mirrors the teacher crate's `resource.rs` split between a bag of numeric
//! limits and a pluggable enforcement policy, adapted to the dialect-trait
//! bitmask and depth limits this spec calls for.

use std::fmt;

/// A tiny hand-rolled stand-in for the `bitflags` crate: the trait set is
/// small and fixed, so a macro generating a `Copy` bit-set newtype keeps the
/// dependency footprint aligned with the teacher (which does not pull in
/// `bitflags` anywhere in its tree either).
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self($value);
            )*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.0 |= other.0;
                } else {
                    self.0 &= !other.0;
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Dialect traits toggled by `@pragma` (spec §4.2) or set up-front by the
    /// embedder. Each bit matches one pragma name.
    pub struct Traits: u32 {
        /// Undeclared identifiers become named variables at first use.
        const IMPLICIT = 1 << 0;
        /// String literals may contain literal newlines.
        const MULTILINE_STR = 1 << 1;
        /// `cmd |& getline` / `print |& cmd` bidirectional pipes are allowed.
        const RWPIPE = 1 << 2;
        /// FS-is-blank record splitting also strips/collapses whitespace when
        /// FS is a whitespace-only regex.
        const STRIPRECSPC = 1 << 3;
        /// Leading/trailing whitespace is stripped before numeric conversion.
        const STRIPSTRSPC = 1 << 4;
        /// Numeric-looking strings are flagged as numeric strings.
        const NUMSTRDETECT = 1 << 5;
        /// `a b` (adjacency) performs string concatenation.
        const BLANK_CONCAT = 1 << 6;
        /// `nextofile` is a recognized statement.
        const RWEXIT = 1 << 7;
    }
}

/// Depth limits, matching the knobs named in spec §6.5.
#[derive(Debug, Clone, Copy)]
pub struct DepthLimits {
    pub include: usize,
    pub block_parse: usize,
    pub block_run: usize,
    pub expr_parse: usize,
    pub expr_run: usize,
    pub rex_build: usize,
    pub rex_match: usize,
}

impl Default for DepthLimits {
    fn default() -> Self {
        Self {
            include: 64,
            block_parse: 256,
            block_run: 4096,
            expr_parse: 512,
            expr_run: 8192,
            rex_build: 64,
            rex_match: 8192,
        }
    }
}

/// Module search configuration consulted by the module registry (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    pub prefix: String,
    pub postfix: String,
    pub libdirs: Vec<String>,
}

/// The options struct an embedder supplies at open time (spec §6.5).
#[derive(Debug, Clone)]
pub struct Options {
    pub traits: Traits,
    pub modules: ModuleConfig,
    pub include_dirs: Vec<String>,
    pub depth: DepthLimits,
    pub rtx_stack_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            traits: Traits::IMPLICIT | Traits::BLANK_CONCAT | Traits::NUMSTRDETECT,
            modules: ModuleConfig::default(),
            include_dirs: Vec::new(),
            depth: DepthLimits::default(),
            rtx_stack_limit: 65536,
        }
    }
}

impl fmt::Display for Traits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_bitor_and_contains() {
        let t = Traits::IMPLICIT | Traits::BLANK_CONCAT;
        assert!(t.contains(Traits::IMPLICIT));
        assert!(t.contains(Traits::BLANK_CONCAT));
        assert!(!t.contains(Traits::RWPIPE));
    }

    #[test]
    fn traits_set_toggles_bit() {
        let mut t = Traits::empty();
        t.set(Traits::MULTILINE_STR, true);
        assert!(t.contains(Traits::MULTILINE_STR));
        t.set(Traits::MULTILINE_STR, false);
        assert!(!t.contains(Traits::MULTILINE_STR));
    }
}
