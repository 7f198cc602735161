use crate::analyser::analyze;
use crate::analysis_config::AnalysisConfig;
use crate::cache_config::{CacheHierarchy, CacheLevel, CacheLevelConfig};
use crate::chmc::{ChmcTable, Classification};
use crate::errors::ChmcError;
use crate::lifter::lift_from;
use crate::memory_ref::RefKind;
use crate::program::Program;
use std::rc::Rc;

use Classification::*;

pub fn small_hierarchy() -> Rc<CacheHierarchy> {
    Rc::new(
        CacheHierarchy::new([
            CacheLevelConfig::new(CacheLevel::L1I, 2048, 1, 64).unwrap(),
            CacheLevelConfig::new(CacheLevel::L1D, 2048, 2, 64).unwrap(),
            CacheLevelConfig::new(CacheLevel::L2, 16384, 4, 64).unwrap(),
        ])
        .unwrap(),
    )
}

fn run(exported: &str, config: &AnalysisConfig) -> ChmcTable {
    let prog = lift_from(exported).unwrap();
    analyze(&prog, &small_hierarchy(), config).unwrap()
}

#[track_caller]
fn assert_chmc(
    table: &ChmcTable,
    instruction: u64,
    kind: RefKind,
    level: CacheLevel,
    expected: Classification,
) {
    let entry = table
        .lookup(instruction, kind, level)
        .unwrap_or_else(|| panic!("no entry for {:#x} {} at {}", instruction, kind, level));
    assert_eq!(
        entry.classification, expected,
        "{:#x} {} at {}",
        instruction, kind, level
    );
}

const FIXED_LOAD_IN_LOOP: &str = r#"
SEGMENT bss .bss WA 0x411000 0x411040
PROCEDURE main
NODE entry STRAIGHT
  400580: adrp x1, 411000 <buf>
NODE body LOOP
  400584: ldr x0, [x1, #8]
  400588: b.ne 400584 <main+0x4>
NODE exit STRAIGHT
  40058c: ret
EDGE - entry
EDGE entry body
EDGE body body
EDGE body exit
LOOP body body
END
"#;

/// A load from a fixed `.bss` address inside a single-node loop
pub fn fixed_load_in_loop_program() -> Program {
    lift_from(FIXED_LOAD_IN_LOOP).unwrap()
}

#[test]
fn fixed_load_in_loop_misses_once() {
    let table = analyze(
        &fixed_load_in_loop_program(),
        &small_hierarchy(),
        &AnalysisConfig::default(),
    )
    .unwrap();

    let load = table
        .lookup(0x400584, RefKind::Data, CacheLevel::L1D)
        .unwrap();
    assert_eq!(load.classification, FirstMissThenHit);
    assert_eq!(load.loop_context.as_deref(), Some("loop@body"));

    // All four instructions share a single line
    assert_chmc(&table, 0x400580, RefKind::Instruction, CacheLevel::L1I, AlwaysMiss);
    assert_chmc(&table, 0x400584, RefKind::Instruction, CacheLevel::L1I, AlwaysHit);
    assert_chmc(&table, 0x400588, RefKind::Instruction, CacheLevel::L1I, AlwaysHit);
    assert_chmc(&table, 0x40058c, RefKind::Instruction, CacheLevel::L1I, AlwaysHit);

    // Hits at L1I never reach L2
    assert!(table
        .lookup(0x40058c, RefKind::Instruction, CacheLevel::L2)
        .is_none());
    assert_chmc(&table, 0x400580, RefKind::Instruction, CacheLevel::L2, AlwaysMiss);
}

#[test]
fn persistence_can_be_disabled() {
    let config = AnalysisConfig {
        enable_persistence_analysis: false,
        ..Default::default()
    };
    let table = run(FIXED_LOAD_IN_LOOP, &config);
    assert_chmc(&table, 0x400584, RefKind::Data, CacheLevel::L1D, NotClassified);
}

#[test]
fn unresolved_load_is_not_classified() {
    let table = run(
        r#"
PROCEDURE spin
NODE head LOOP
  400600: ldr x0, [x2]
  400604: b 400600 <spin>
EDGE - head
EDGE head head
LOOP head head
END
"#,
        &AnalysisConfig::default(),
    );
    assert_chmc(&table, 0x400600, RefKind::Data, CacheLevel::L1D, NotClassified);
    // The unknown address is never refined, but the fetches around it are
    assert_chmc(
        &table,
        0x400600,
        RefKind::Instruction,
        CacheLevel::L1I,
        FirstMissThenHit,
    );
}

#[test]
fn stack_store_then_load_hits() {
    let table = run(
        r#"
PROCEDURE main
NODE n0 STRAIGHT
  400700: str x0, [sp, #16]
  400704: ldr x1, [sp, #16]
  400708: ret
EDGE - n0
END
"#,
        &AnalysisConfig::default(),
    );
    assert_chmc(&table, 0x400700, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    assert_chmc(&table, 0x400704, RefKind::Data, CacheLevel::L1D, AlwaysHit);
    assert_chmc(&table, 0x400700, RefKind::Data, CacheLevel::L2, AlwaysMiss);
    assert!(table
        .lookup(0x400704, RefKind::Data, CacheLevel::L2)
        .is_none());
    assert_eq!(
        table
            .lookup(0x400700, RefKind::Data, CacheLevel::L2)
            .unwrap()
            .access,
        crate::dataflow::AccessClass::Always
    );
}

#[test]
fn stack_slots_move_with_the_stack_pointer() {
    let table = run(
        r#"
PROCEDURE main
NODE n0 STRAIGHT
  400700: str x0, [sp, #16]
  400704: sub sp, sp, #0x1000
  400708: ldr x1, [sp, #16]
  40070c: add sp, sp, #0x1000
  400710: ldr x2, [sp, #16]
  400714: ret
EDGE - n0
END
"#,
        &AnalysisConfig::default(),
    );
    // A different slot, never touched before
    assert_chmc(&table, 0x400708, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    // The slot stored to first
    assert_chmc(&table, 0x400710, RefKind::Data, CacheLevel::L1D, AlwaysHit);
}

#[test]
fn callee_frames_do_not_alias_the_caller_frame() {
    let table = run(
        r#"
PROCEDURE leaf
NODE l0 STRAIGHT
  400e00: str x0, [sp, #-0x800]
  400e04: str x1, [sp, #-0x400]
  400e08: ret
EDGE - l0
END
PROCEDURE main
NODE m0 STRAIGHT
  400f00: sub sp, sp, #0x800
  400f04: str x0, [sp]
NODE m1 VIRTUAL leaf
NODE m2 STRAIGHT
  400f08: ldr x1, [sp]
  400f0c: ret
EDGE - m0
EDGE m0 m1
EDGE m1 m2
END
"#,
        &AnalysisConfig::default(),
    );
    assert_chmc(&table, 0x400f04, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    // Both callee slots lie below the caller's, in the same set, and evict it
    assert_chmc(&table, 0x400f08, RefKind::Data, CacheLevel::L1D, NotClassified);
}

#[test]
fn warm_cache_at_roots_leaves_first_accesses_open() {
    let config = AnalysisConfig {
        assume_cold_cache_at_roots: false,
        ..Default::default()
    };
    let table = run(
        r#"
PROCEDURE main
NODE n0 STRAIGHT
  400700: str x0, [sp, #16]
  400704: ldr x1, [sp, #16]
EDGE - n0
END
"#,
        &config,
    );
    assert_chmc(&table, 0x400700, RefKind::Data, CacheLevel::L1D, NotClassified);
    assert_chmc(&table, 0x400704, RefKind::Data, CacheLevel::L1D, AlwaysHit);
}

fn call_across(callee_name: &str) -> String {
    format!(
        r#"
SEGMENT bss .bss WA 0x411040 0x411080
SEGMENT data .data WA 0x412000 0x412100
PROCEDURE touch
NODE t0 STRAIGHT
  400900: adrp x3, 411000
  400904: ldr x4, [x3, #0x40]
  400908: ret
EDGE - t0
END
PROCEDURE main
NODE m0 STRAIGHT
  400800: adrp x1, 412000 <table>
  400804: ldr x0, [x1]
NODE m1 VIRTUAL {}
NODE m2 STRAIGHT
  400808: ldr x2, [x1]
  40080c: ret
EDGE - m0
EDGE m0 m1
EDGE m1 m2
END
"#,
        callee_name
    )
}

#[test]
fn call_footprints_age_only_their_sets() {
    let table = run(&call_across("touch"), &AnalysisConfig::default());
    assert_chmc(&table, 0x400804, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    assert_chmc(&table, 0x400808, RefKind::Data, CacheLevel::L1D, AlwaysHit);
    // The callee is not a root, so its cache state on entry is unknown
    assert_chmc(&table, 0x400904, RefKind::Data, CacheLevel::L1D, NotClassified);
}

#[test]
fn unknown_callees_clobber_the_cache() {
    let clobbered = run(&call_across("memcpy"), &AnalysisConfig::default());
    assert_chmc(
        &clobbered,
        0x400808,
        RefKind::Data,
        CacheLevel::L1D,
        NotClassified,
    );

    let config = AnalysisConfig {
        unknown_callees_clobber_cache: false,
        ..Default::default()
    };
    let ignored = run(&call_across("memcpy"), &config);
    assert_chmc(&ignored, 0x400808, RefKind::Data, CacheLevel::L1D, AlwaysHit);
}

#[test]
fn recursive_calls_act_as_unknown_callees() {
    let table = run(
        r#"
SEGMENT data .data WA 0x412000 0x412100
PROCEDURE main
NODE m0 VIRTUAL walk
EDGE - m0
END
PROCEDURE walk
NODE w0 STRAIGHT
  400a00: adrp x1, 412000
  400a04: ldr x0, [x1]
NODE w1 VIRTUAL walk
NODE w2 STRAIGHT
  400a08: ldr x2, [x1]
  400a0c: ret
EDGE - w0
EDGE w0 w1
EDGE w1 w2
END
"#,
        &AnalysisConfig::default(),
    );
    assert_chmc(&table, 0x400a08, RefKind::Data, CacheLevel::L1D, NotClassified);
}

fn loop_over_lines(count: u64) -> String {
    let loads: String = (0..count)
        .map(|i| format!("  {:x}: ldr x{}, [x1, #{:#x}]\n", 0x400b04 + 4 * i, i + 2, i * 0x400))
        .collect();
    format!(
        r#"
SEGMENT data .data WA 0x412000 0x413000
PROCEDURE main
NODE pre STRAIGHT
  400b00: adrp x1, 412000
NODE body LOOP
{}  400b80: b.ne 400b04
NODE post STRAIGHT
  400b84: ret
EDGE - pre
EDGE pre body
EDGE body body
EDGE body post
LOOP body body
END
"#,
        loads
    )
}

#[test]
fn conflicting_lines_in_loop_are_not_persistent() {
    let config = AnalysisConfig {
        use_exact_segment_addresses: true,
        ..Default::default()
    };

    // Two lines of the same set fit a two-way cache
    let table = run(&loop_over_lines(2), &config);
    for ins in [0x400b04, 0x400b08] {
        assert_chmc(&table, ins, RefKind::Data, CacheLevel::L1D, FirstMissThenHit);
    }

    // A third one evicts the others on every iteration, so each load always misses
    let table = run(&loop_over_lines(3), &config);
    for ins in [0x400b04, 0x400b08, 0x400b0c] {
        assert_chmc(&table, ins, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
        let entry = table.lookup(ins, RefKind::Data, CacheLevel::L1D).unwrap();
        assert_ne!(entry.classification, FirstMissThenHit);
    }
}

#[test]
fn outermost_persistent_loop_is_the_context() {
    let table = run(
        r#"
SEGMENT bss .bss WA 0x411000 0x411040
PROCEDURE main
NODE pre STRAIGHT
  400c00: adrp x1, 411000
NODE outer LOOP
  400c04: nop
NODE inner LOOP
  400c08: ldr x0, [x1]
  400c0c: b.ne 400c08
NODE latch STRAIGHT
  400c10: b.ne 400c04
NODE post STRAIGHT
  400c14: ret
EDGE - pre
EDGE pre outer
EDGE outer inner
EDGE inner inner
EDGE inner latch
EDGE latch outer
EDGE latch post
LOOP outer outer inner latch
LOOP inner inner
END
"#,
        &AnalysisConfig::default(),
    );
    let load = table
        .lookup(0x400c08, RefKind::Data, CacheLevel::L1D)
        .unwrap();
    assert_eq!(load.classification, FirstMissThenHit);
    assert_eq!(load.loop_context.as_deref(), Some("loop@outer"));
}

#[test]
fn indexed_accesses_cover_their_segment() {
    let exported = r#"
SEGMENT bss .bss WA 0x411000 0x411100
PROCEDURE main
NODE n0 STRAIGHT
  400d00: adrp x1, 411000
  400d04: mov x2, #0
  400d08: ldr x0, [x1, x2, lsl #3]
  400d0c: ldr x3, [x1]
EDGE - n0
END
"#;
    // The indexed load may bring in any line of the segment
    let table = run(exported, &AnalysisConfig::default());
    assert_chmc(&table, 0x400d08, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    assert_chmc(&table, 0x400d0c, RefKind::Data, CacheLevel::L1D, NotClassified);

    let config = AnalysisConfig {
        treat_indexed_accesses_as_ranges: false,
        ..Default::default()
    };
    let table = run(exported, &config);
    assert_chmc(&table, 0x400d08, RefKind::Data, CacheLevel::L1D, AlwaysMiss);
    assert_chmc(&table, 0x400d0c, RefKind::Data, CacheLevel::L1D, AlwaysHit);
}

#[test]
fn empty_program_is_rejected() {
    let prog = Program::new(Default::default());
    assert!(matches!(
        analyze(&prog, &small_hierarchy(), &AnalysisConfig::default()),
        Err(ChmcError::MissingInput(_))
    ));
}

#[test]
fn table_serializes_every_level() {
    let table = run(FIXED_LOAD_IN_LOOP, &AnalysisConfig::default());
    let text = table.serialize();
    assert!(text.starts_with("CHMC\n"));
    assert!(text.contains("\tmain\tbody\t0x400584\tDATA\tL1D\talways\tloop@body\tFM\n"));
    assert!(text.contains("\nSUMMARY\n"));
    assert!(text.contains("\tL2\t"));
}
