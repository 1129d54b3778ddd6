//! CPU architecture identifiers and best-match ranking
//!
//! Identifiers use the Mach-O `(cputype, cpusubtype)` numbering so that
//! containers produced here interoperate with existing boot loaders.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 64-bit ABI flag or'd into the CPU type
pub const CPU_ARCH_ABI64: i32 = 0x0100_0000;
/// Matches any CPU type
pub const CPU_TYPE_ANY: i32 = -1;
pub const CPU_TYPE_X86: i32 = 7;
pub const CPU_TYPE_X86_64: i32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: i32 = 12;
pub const CPU_TYPE_ARM64: i32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_POWERPC: i32 = 18;
pub const CPU_TYPE_POWERPC64: i32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

/// Generic request for a processor family
pub const CPU_SUBTYPE_MULTIPLE: i32 = -1;
/// Capability bits carried in the high byte of a subtype
pub const CPU_SUBTYPE_MASK: i32 = 0xff00_0000_u32 as i32;

/// A CPU architecture: type plus subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchId {
    pub cputype: i32,
    pub cpusubtype: i32,
}

/// Named architectures accepted on the command line and in manifests
const NAMED: &[(&str, i32, i32)] = &[
    ("any", CPU_TYPE_ANY, CPU_SUBTYPE_MULTIPLE),
    ("i386", CPU_TYPE_X86, 3),
    ("x86_64", CPU_TYPE_X86_64, 3),
    ("x86_64h", CPU_TYPE_X86_64, 8),
    ("ppc", CPU_TYPE_POWERPC, 0),
    ("ppc7400", CPU_TYPE_POWERPC, 10),
    ("ppc970", CPU_TYPE_POWERPC, 100),
    ("ppc64", CPU_TYPE_POWERPC64, 0),
    ("armv7", CPU_TYPE_ARM, 9),
    ("arm64", CPU_TYPE_ARM64, 0),
    ("arm64e", CPU_TYPE_ARM64, 2),
];

impl ArchId {
    pub const ANY: ArchId = ArchId::new(CPU_TYPE_ANY, CPU_SUBTYPE_MULTIPLE);

    pub const fn new(cputype: i32, cpusubtype: i32) -> Self {
        Self {
            cputype,
            cpusubtype,
        }
    }

    /// Look up a named architecture
    pub fn from_name(name: &str) -> Option<Self> {
        NAMED
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|&(_, t, s)| Self::new(t, s))
    }

    /// The conventional name, if this is a well-known architecture
    pub fn name(&self) -> Option<&'static str> {
        NAMED
            .iter()
            .find(|&&(_, t, s)| t == self.cputype && s == self.subtype())
            .map(|(n, _, _)| *n)
    }

    /// The architecture this binary was compiled for
    pub fn host() -> Self {
        let name = if cfg!(target_arch = "x86_64") {
            "x86_64"
        } else if cfg!(target_arch = "aarch64") {
            "arm64"
        } else if cfg!(target_arch = "x86") {
            "i386"
        } else if cfg!(target_arch = "powerpc64") {
            "ppc64"
        } else if cfg!(target_arch = "powerpc") {
            "ppc"
        } else if cfg!(target_arch = "arm") {
            "armv7"
        } else {
            "any"
        };
        Self::from_name(name).unwrap_or(Self::ANY)
    }

    /// Subtype with capability bits stripped
    pub fn subtype(&self) -> i32 {
        if self.cpusubtype == CPU_SUBTYPE_MULTIPLE {
            return CPU_SUBTYPE_MULTIPLE;
        }
        self.cpusubtype & !CPU_SUBTYPE_MASK
    }

    /// Whether this identifier asks for "anything in the family"
    pub fn is_generic_request(&self) -> bool {
        self.subtype() == CPU_SUBTYPE_MULTIPLE || Some(self.subtype()) == family_all(self.cputype)
    }

    /// Rank how well a slice built for `self` serves a request for `want`.
    ///
    /// Lower is better; `None` means the slice cannot run on `want`.
    pub fn rank_for(&self, want: &ArchId) -> Option<u8> {
        if self.cputype == want.cputype && self.subtype() == want.subtype() {
            return Some(0);
        }
        if want.cputype == CPU_TYPE_ANY {
            return Some(3);
        }
        if self.cputype != want.cputype {
            return None;
        }
        let generic = family_all(self.cputype);
        if Some(self.subtype()) == generic {
            // a family-generic slice runs on every member of the family
            return Some(1);
        }
        if want.is_generic_request() {
            return Some(2);
        }
        None
    }
}

/// The "ALL" subtype for a CPU family
fn family_all(cputype: i32) -> Option<i32> {
    match cputype {
        CPU_TYPE_X86 | CPU_TYPE_X86_64 => Some(3),
        CPU_TYPE_POWERPC | CPU_TYPE_POWERPC64 | CPU_TYPE_ARM | CPU_TYPE_ARM64 => Some(0),
        _ => None,
    }
}

/// Pick the index of the best candidate for `want`; ties go to the earliest.
pub fn best_match(candidates: impl IntoIterator<Item = ArchId>, want: &ArchId) -> Option<usize> {
    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(i, arch)| arch.rank_for(want).map(|rank| (rank, i)))
        .min()
        .map(|(_, i)| i)
}

impl fmt::Display for ArchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}:{}", self.cputype, self.cpusubtype),
        }
    }
}

impl FromStr for ArchId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(arch) = Self::from_name(s) {
            return Ok(arch);
        }
        // numeric "cputype:cpusubtype"
        let (t, st) = s
            .split_once(':')
            .ok_or_else(|| format!("unknown architecture '{}'", s))?;
        let cputype = t
            .trim()
            .parse()
            .map_err(|_| format!("bad cputype in '{}'", s))?;
        let cpusubtype = st
            .trim()
            .parse()
            .map_err(|_| format!("bad cpusubtype in '{}'", s))?;
        Ok(Self::new(cputype, cpusubtype))
    }
}

impl TryFrom<String> for ArchId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArchId> for String {
    fn from(arch: ArchId) -> Self {
        arch.to_string()
    }
}
