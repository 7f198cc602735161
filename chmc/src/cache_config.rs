//! Description of the cache hierarchy under analysis, and the line/set/tag arithmetic derived from
//! it.
//!
//! A [`CacheHierarchy`] is built once, validated, and then shared read-only (behind an `Rc`) by
//! every memory reference and every analysis pass.

use std::collections::BTreeMap;

use crate::errors::{ChmcError, Result};
use crate::memory_ref::RefKind;

/// A level of the cache hierarchy. The split first level (`L1I`, `L1D`) sits below the unified
/// levels, which are ordered by depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheLevel {
    L1I,
    L1D,
    L2,
    L3,
}

impl CacheLevel {
    /// Whether references of `kind` go through this level.
    pub fn serves(self, kind: RefKind) -> bool {
        match self {
            CacheLevel::L1I => kind == RefKind::Instruction,
            CacheLevel::L1D => kind == RefKind::Data,
            CacheLevel::L2 | CacheLevel::L3 => true,
        }
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            CacheLevel::L1I => "L1I",
            CacheLevel::L1D => "L1D",
            CacheLevel::L2 => "L2",
            CacheLevel::L3 => "L3",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for CacheLevel {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L1I" => Ok(CacheLevel::L1I),
            "L1D" => Ok(CacheLevel::L1D),
            "L2" => Ok(CacheLevel::L2),
            "L3" => Ok(CacheLevel::L3),
            _ => Err(format!("unknown cache level `{}`", s)),
        }
    }
}

/// Geometry of a single cache level. Immutable once constructed; construction enforces that the
/// line size is a power of two and that the capacity is a positive multiple of one set's worth of
/// lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLevelConfig {
    level: CacheLevel,
    capacity_bytes: u64,
    associativity: u32,
    line_size: u64,
    line_shift: u32,
    num_sets: u64,
}

impl CacheLevelConfig {
    /// Validate and build the geometry of `level`.
    pub fn new(
        level: CacheLevel,
        capacity_bytes: u64,
        associativity: u32,
        line_size: u64,
    ) -> Result<Self> {
        let invalid = |reason: String| ChmcError::Configuration {
            level: level.to_string(),
            reason,
        };
        if line_size == 0 || !line_size.is_power_of_two() {
            return Err(invalid(format!(
                "line size {} is not a power of two",
                line_size
            )));
        }
        if associativity == 0 {
            return Err(invalid("associativity must be positive".into()));
        }
        let set_bytes = line_size
            .checked_mul(u64::from(associativity))
            .ok_or_else(|| invalid("associativity x line size overflows".into()))?;
        if capacity_bytes == 0 || capacity_bytes % set_bytes != 0 {
            return Err(invalid(format!(
                "capacity {} is not a positive multiple of associativity x line size ({})",
                capacity_bytes, set_bytes
            )));
        }
        Ok(Self {
            level,
            capacity_bytes,
            associativity,
            line_size,
            line_shift: line_size.trailing_zeros(),
            num_sets: capacity_bytes / set_bytes,
        })
    }

    pub fn level(&self) -> CacheLevel {
        self.level
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn associativity(&self) -> u32 {
        self.associativity
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    /// `log2(line_size)`
    pub fn line_shift(&self) -> u32 {
        self.line_shift
    }

    pub fn num_sets(&self) -> u64 {
        self.num_sets
    }

    /// The line holding byte `address`
    pub fn line_index(&self, address: u64) -> u64 {
        address >> self.line_shift
    }

    /// The set a line maps to
    pub fn set_of_line(&self, line_index: u64) -> u64 {
        line_index % self.num_sets
    }

    /// The tag that distinguishes a line within its set
    pub fn tag_of_line(&self, line_index: u64) -> u64 {
        line_index / self.num_sets
    }

    pub fn set_index(&self, address: u64) -> u64 {
        self.set_of_line(self.line_index(address))
    }

    pub fn tag(&self, address: u64) -> u64 {
        self.tag_of_line(self.line_index(address))
    }

    /// Inverse of ([`Self::set_of_line`], [`Self::tag_of_line`])
    pub fn recombine(&self, set_index: u64, tag: u64) -> u64 {
        tag * self.num_sets + set_index
    }
}

/// Geometry triple as given on the command line, before it is tied to a level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    pub capacity_bytes: u64,
    pub associativity: u32,
    pub line_size: u64,
}

impl CacheGeometry {
    pub fn for_level(self, level: CacheLevel) -> Result<CacheLevelConfig> {
        CacheLevelConfig::new(
            level,
            self.capacity_bytes,
            self.associativity,
            self.line_size,
        )
    }
}

/// Parse `capacity,associativity,line_size` (decimal or `0x` hex)
pub fn parse_geometry(s: &str) -> std::result::Result<CacheGeometry, String> {
    fn num(s: &str) -> std::result::Result<u64, String> {
        let s = s.trim();
        match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        }
        .map_err(|e| format!("`{}`: {}", s, e))
    }
    match s.split(',').collect::<Vec<_>>()[..] {
        [capacity, assoc, line] => Ok(CacheGeometry {
            capacity_bytes: num(capacity)?,
            associativity: u32::try_from(num(assoc)?).map_err(|e| e.to_string())?,
            line_size: num(line)?,
        }),
        _ => Err(format!(
            "expected `capacity,associativity,line_size`, got `{}`",
            s
        )),
    }
}

/// The complete set of configured cache levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHierarchy {
    levels: BTreeMap<CacheLevel, CacheLevelConfig>,
    finest_line_shift: u32,
}

impl CacheHierarchy {
    /// Assemble a hierarchy. Levels must be unique, the first level must be present for both
    /// reference kinds (split or through a unified level), and unified levels must be contiguous
    /// (no `L3` without `L2`).
    pub fn new(levels: impl IntoIterator<Item = CacheLevelConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for cfg in levels {
            let level = cfg.level();
            if map.insert(level, cfg).is_some() {
                return Err(ChmcError::Configuration {
                    level: level.to_string(),
                    reason: "level configured more than once".into(),
                });
            }
        }
        if map.is_empty() {
            return Err(ChmcError::MissingInput("no cache level configured".into()));
        }
        if map.contains_key(&CacheLevel::L3) && !map.contains_key(&CacheLevel::L2) {
            return Err(ChmcError::Configuration {
                level: CacheLevel::L3.to_string(),
                reason: "configured without an L2 below it".into(),
            });
        }
        for kind in [RefKind::Instruction, RefKind::Data] {
            if !map.keys().any(|level| level.serves(kind)) {
                return Err(ChmcError::MissingInput(format!(
                    "no cache level serves {} references",
                    kind
                )));
            }
        }
        let finest_line_shift = map
            .values()
            .map(CacheLevelConfig::line_shift)
            .min()
            .unwrap_or(0);
        Ok(Self {
            levels: map,
            finest_line_shift,
        })
    }

    pub fn get(&self, level: CacheLevel) -> Option<&CacheLevelConfig> {
        self.levels.get(&level)
    }

    /// All levels, nearest first
    pub fn iter(&self) -> impl Iterator<Item = &CacheLevelConfig> {
        self.levels.values()
    }

    /// `log2` of the smallest line size; references are identified at this granularity.
    pub fn finest_line_shift(&self) -> u32 {
        self.finest_line_shift
    }

    pub fn finest_line_size(&self) -> u64 {
        1 << self.finest_line_shift
    }

    /// The levels a reference of `kind` travels through, nearest first.
    pub fn levels_for(&self, kind: RefKind) -> Vec<&CacheLevelConfig> {
        self.levels
            .values()
            .filter(|cfg| cfg.level().serves(kind))
            .collect()
    }

    /// The level consulted by `kind` before reaching `level`, if any.
    pub fn previous_level(&self, kind: RefKind, level: CacheLevel) -> Option<&CacheLevelConfig> {
        let chain = self.levels_for(kind);
        let pos = chain.iter().position(|cfg| cfg.level() == level)?;
        pos.checked_sub(1).map(|p| chain[p])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_index_is_bounded_and_recombines() {
        let cfg = CacheLevelConfig::new(CacheLevel::L1D, 2048, 2, 64).unwrap();
        assert_eq!(cfg.num_sets(), 16);
        for address in (0..0x10_0000u64).step_by(52) {
            let line = cfg.line_index(address);
            let set = cfg.set_index(address);
            assert!(set < cfg.num_sets());
            assert_eq!(cfg.recombine(set, cfg.tag(address)), line);
        }
    }

    #[test]
    fn invalid_geometries_are_rejected() {
        assert!(matches!(
            CacheLevelConfig::new(CacheLevel::L1D, 2048, 2, 48),
            Err(ChmcError::Configuration { .. })
        ));
        assert!(matches!(
            CacheLevelConfig::new(CacheLevel::L2, 1000, 4, 64),
            Err(ChmcError::Configuration { .. })
        ));
        assert!(CacheLevelConfig::new(CacheLevel::L2, 0, 4, 64).is_err());
        assert!(CacheLevelConfig::new(CacheLevel::L2, 4096, 0, 64).is_err());
    }

    #[test]
    fn hierarchy_orders_levels_per_kind() {
        let h = CacheHierarchy::new([
            CacheLevelConfig::new(CacheLevel::L2, 16384, 4, 64).unwrap(),
            CacheLevelConfig::new(CacheLevel::L1I, 2048, 1, 32).unwrap(),
            CacheLevelConfig::new(CacheLevel::L1D, 2048, 2, 64).unwrap(),
        ])
        .unwrap();
        let inst: Vec<_> = h
            .levels_for(RefKind::Instruction)
            .iter()
            .map(|c| c.level())
            .collect();
        assert_eq!(inst, vec![CacheLevel::L1I, CacheLevel::L2]);
        assert_eq!(
            h.previous_level(RefKind::Data, CacheLevel::L2)
                .map(|c| c.level()),
            Some(CacheLevel::L1D)
        );
        assert!(h.previous_level(RefKind::Data, CacheLevel::L1D).is_none());
        assert_eq!(h.finest_line_shift(), 5);
    }

    #[test]
    fn hierarchy_rejects_duplicates_and_gaps() {
        let l2 = CacheLevelConfig::new(CacheLevel::L2, 16384, 4, 64).unwrap();
        assert!(CacheHierarchy::new([l2.clone(), l2]).is_err());
        let l3 = CacheLevelConfig::new(CacheLevel::L3, 65536, 8, 64).unwrap();
        assert!(CacheHierarchy::new([l3]).is_err());
        let l1d = CacheLevelConfig::new(CacheLevel::L1D, 2048, 2, 64).unwrap();
        assert!(matches!(
            CacheHierarchy::new([l1d]),
            Err(ChmcError::MissingInput(_))
        ));
        assert!(CacheHierarchy::new(Vec::new()).is_err());
    }

    #[test]
    fn geometry_parses_from_command_line() {
        assert_eq!(
            parse_geometry("65536,2,0x40"),
            Ok(CacheGeometry {
                capacity_bytes: 65536,
                associativity: 2,
                line_size: 64
            })
        );
        assert!(parse_geometry("65536,2").is_err());
        assert!(parse_geometry("a,b,c").is_err());
    }
}
