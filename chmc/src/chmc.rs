//! Cache hit/miss classifications, the table reporting them, and execution-interval statistics
//! over that table.

use crate::cache_config::CacheLevel;
use crate::containers::unordered::UnorderedMap;
use crate::dataflow::AccessClass;
use crate::errors::{ChmcError, Result};
use crate::log::*;
use crate::memory_ref::RefKind;

/// The static verdict for one access at one cache level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    AlwaysHit,
    AlwaysMiss,
    /// Misses on the first iteration of its loop context, hits afterwards
    FirstMissThenHit,
    NotClassified,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Classification::AlwaysHit => write!(f, "AH"),
            Classification::AlwaysMiss => write!(f, "AM"),
            Classification::FirstMissThenHit => write!(f, "FM"),
            Classification::NotClassified => write!(f, "NC"),
        }
    }
}

/// One row of the CHMC table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChmcEntry {
    pub procedure: String,
    pub node: String,
    pub instruction: u64,
    pub kind: RefKind,
    pub level: CacheLevel,
    pub access: AccessClass,
    /// The loop the classification holds in, if any
    pub loop_context: Option<String>,
    pub classification: Classification,
}

/// Counts of classifications per cache level
pub type ClassificationCounts = UnorderedMap<(CacheLevel, Classification), usize>;

/// The final classification of every access, at every level it may reach.
#[derive(Clone, Debug, Default)]
pub struct ChmcTable {
    entries: Vec<ChmcEntry>,
}

impl ChmcTable {
    pub fn new(mut entries: Vec<ChmcEntry>) -> Self {
        entries.sort_by(|a, b| {
            (&a.procedure, a.instruction, a.kind, a.level).cmp(&(
                &b.procedure,
                b.instruction,
                b.kind,
                b.level,
            ))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[ChmcEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for the access of `kind` by the instruction at `instruction`, at `level`
    pub fn lookup(&self, instruction: u64, kind: RefKind, level: CacheLevel) -> Option<&ChmcEntry> {
        self.entries
            .iter()
            .find(|e| e.instruction == instruction && e.kind == kind && e.level == level)
    }

    /// Count classifications per level, over the entries selected by `filter`
    pub fn counts_where(&self, filter: impl Fn(&ChmcEntry) -> bool) -> ClassificationCounts {
        let mut r = ClassificationCounts::new();
        for e in self.entries.iter().filter(|e| filter(e)) {
            *r.entry((e.level, e.classification)).or_insert(0) += 1;
        }
        r
    }

    pub fn counts(&self) -> ClassificationCounts {
        self.counts_where(|_| true)
    }

    /// Lowest and highest classified instruction address
    pub fn span(&self) -> Option<AddressRange> {
        let lo = self.entries.iter().map(|e| e.instruction).min()?;
        let hi = self.entries.iter().map(|e| e.instruction).max()?;
        Some(AddressRange { lo, hi })
    }

    /// Log the per-level classification counts
    pub fn log_summary(&self) {
        for ((level, classification), count) in self.counts().iter() {
            info!(
                "Classification summary";
                "level" => %level,
                "chmc" => %classification,
                "count" => count,
            );
        }
    }

    /// Serialize the table
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for ChmcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "CHMC")?;
        for e in &self.entries {
            writeln!(
                f,
                "\t{}\t{}\t{:#x}\t{}\t{}\t{}\t{}\t{}",
                e.procedure,
                e.node,
                e.instruction,
                e.kind,
                e.level,
                e.access,
                e.loop_context.as_deref().unwrap_or("-"),
                e.classification,
            )?;
        }
        writeln!(f)?;
        writeln!(f, "SUMMARY")?;
        for ((level, classification), count) in self.counts().iter() {
            writeln!(f, "\t{}\t{}\t{}", level, classification, count)?;
        }
        Ok(())
    }
}

/// An inclusive range of instruction addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub lo: u64,
    pub hi: u64,
}

impl AddressRange {
    pub fn contains(&self, address: u64) -> bool {
        self.lo <= address && address <= self.hi
    }

    pub fn covers(&self, other: &AddressRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}-{:#x}", self.lo, self.hi)
    }
}

pub fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("bad address `{}`: {}", s, e))
}

impl std::str::FromStr for AddressRange {
    type Err = String;

    /// Parse `lo-hi`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| format!("expected `<lo>-<hi>`, got `{}`", s))?;
        Ok(AddressRange {
            lo: parse_address(lo)?,
            hi: parse_address(hi)?,
        })
    }
}

/// Classification counts for the entries of one execution interval
#[derive(Clone, Debug)]
pub struct IntervalStatistics {
    pub interval: AddressRange,
    pub counts: ClassificationCounts,
}

/// Compute per-interval classification counts. The target range must lie within the classified
/// instructions, and every interval must be a non-empty range within the target range.
pub fn statistics(
    table: &ChmcTable,
    target: AddressRange,
    intervals: &[AddressRange],
) -> Result<Vec<IntervalStatistics>> {
    let span = table
        .span()
        .ok_or_else(|| ChmcError::OutOfRangeStatistics("no instruction was classified".into()))?;
    if target.lo > target.hi || !span.covers(&target) {
        return Err(ChmcError::OutOfRangeStatistics(format!(
            "target range {} is outside the analyzed range {}",
            target, span
        )));
    }
    intervals
        .iter()
        .map(|&interval| {
            if interval.lo > interval.hi || !target.covers(&interval) {
                return Err(ChmcError::OutOfRangeStatistics(format!(
                    "interval {} is empty or outside the target range {}",
                    interval, target
                )));
            }
            Ok(IntervalStatistics {
                interval,
                counts: table.counts_where(|e| interval.contains(e.instruction)),
            })
        })
        .collect()
}

/// Serialize interval statistics, one block per interval
pub fn serialize_statistics(stats: &[IntervalStatistics]) -> String {
    let mut res = String::new();
    for s in stats {
        res.push_str(&format!("INTERVAL {}\n", s.interval));
        for ((level, classification), count) in s.counts.iter() {
            res.push_str(&format!("\t{}\t{}\t{}\n", level, classification, count));
        }
    }
    res
}
