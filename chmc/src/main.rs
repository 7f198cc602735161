use ::chmc::*;

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;

use crate::analysis_config::{AnalysisConfig, CONFIG};
use crate::cache_config::{CacheGeometry, CacheHierarchy, CacheLevel};
use crate::chmc::AddressRange;
use crate::errors::{ChmcError, Result};
use crate::log::*;

/// Statically classify the cache behavior of binaries
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Classify every memory access of an exported CFG listing
    Analyze {
        /// Path to an exported CFG listing (segments, procedures, nodes, edges and loops)
        exported_cfg: PathBuf,
        /// L1 instruction cache, as `capacity,associativity,line_size`
        #[clap(long, default_value = "65536,1,64", parse(try_from_str = cache_config::parse_geometry))]
        l1i: CacheGeometry,
        /// L1 data cache, as `capacity,associativity,line_size`
        #[clap(long, default_value = "65536,2,64", parse(try_from_str = cache_config::parse_geometry))]
        l1d: CacheGeometry,
        /// Unified L2 cache, as `capacity,associativity,line_size`
        #[clap(long, default_value = "524288,4,64", parse(try_from_str = cache_config::parse_geometry))]
        l2: CacheGeometry,
        /// Analyze the first level only
        #[clap(long)]
        no_l2: bool,
        /// Maximum number of predecessor nodes visited when resolving one address
        #[clap(long, default_value = "100")]
        backtrack_budget: usize,
        /// Address assumed for the stack pointer at procedure entry
        #[clap(long, default_value = "0x7ffff000", parse(try_from_str = crate::chmc::parse_address))]
        stack_base: u64,
        /// Path to output file for the classification table
        #[clap(long)]
        output_chmc: Option<PathBuf>,
        /// Path to output file for interval statistics
        #[clap(long)]
        output_statistics: Option<PathBuf>,
        /// Instruction address range statistics are computed within, as `lo-hi`
        #[clap(long)]
        target_range: Option<AddressRange>,
        /// Execution interval to compute statistics for, as `lo-hi` (repeatable)
        #[clap(long = "interval")]
        intervals: Vec<AddressRange>,
        /// Output one annotated GraphViz `.dot` file per procedure into the given directory
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
    },
}

fn write_or_print(path: Option<PathBuf>, contents: &str) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, contents)?,
        None => print!("{}", contents),
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let Args::Analyze {
        exported_cfg,
        l1i,
        l1d,
        l2,
        no_l2,
        output_chmc,
        output_statistics,
        target_range,
        intervals,
        debug_output_graphviz,
        ..
    } = args;

    let mut levels = vec![
        l1i.for_level(CacheLevel::L1I)?,
        l1d.for_level(CacheLevel::L1D)?,
    ];
    if !no_l2 {
        levels.push(l2.for_level(CacheLevel::L2)?);
    }
    let hierarchy = Rc::new(CacheHierarchy::new(levels)?);

    info!("Lifting program"; "path" => ?exported_cfg);
    let program = lifter::lift_from(&std::fs::read_to_string(&exported_cfg)?)?;

    let table = analyser::analyze(&program, &hierarchy, &CONFIG)?;

    info!("Writing classifications");
    write_or_print(output_chmc, &table.serialize())?;

    match target_range {
        Some(target) => match crate::chmc::statistics(&table, target, &intervals) {
            Ok(stats) => {
                write_or_print(output_statistics, &crate::chmc::serialize_statistics(&stats))?
            }
            Err(e @ ChmcError::OutOfRangeStatistics(_)) => {
                warn!("Skipping statistics"; "reason" => %e);
            }
            Err(e) => return Err(e),
        },
        None if !intervals.is_empty() => {
            warn!("Intervals given without a target range, skipping statistics");
        }
        None => {}
    }

    if let Some(dir) = debug_output_graphviz {
        std::fs::create_dir_all(&dir)?;
        for p in program.procedures() {
            std::fs::write(
                dir.join(format!("{}.dot", p.name)),
                cfg_dot::generate_dot(p, &table)?,
            )?;
        }
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let Args::Analyze {
        backtrack_budget,
        stack_base,
        debug_disable_terminal_logging,
        debug_forced_blocking_terminal_logging,
        log_file,
        debug,
        advanced_config,
        ..
    } = &args;

    let logger = match crate::log::FileAndTermDrain::new(
        *debug,
        *debug_disable_terminal_logging,
        *debug_forced_blocking_terminal_logging,
        log_file.clone(),
    ) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    let log_guard = slog_scope::set_global_logger(logger);

    let mut config = AnalysisConfig::from(advanced_config.clone());
    config.backtrack_node_budget = *backtrack_budget;
    config.stack_base_address = *stack_base;
    AnalysisConfig::initialize(config);

    if let Err(e) = run(args) {
        crit!("Analysis failed"; "error" => %e);
        drop(log_guard);
        std::process::exit(1);
    }

    trace!("Done");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn analyze_arguments_parse() {
        let args = Args::try_parse_from([
            "chmc",
            "analyze",
            "prog.cfg",
            "--no-l2",
            "--stack-base",
            "0x1000",
            "--interval",
            "0x400000-0x400100",
            "-dd",
        ])
        .unwrap();
        let Args::Analyze {
            exported_cfg,
            no_l2,
            stack_base,
            backtrack_budget,
            intervals,
            target_range,
            debug,
            ..
        } = args;
        assert_eq!(exported_cfg, PathBuf::from("prog.cfg"));
        assert!(no_l2);
        assert_eq!(stack_base, 0x1000);
        assert_eq!(backtrack_budget, 100);
        assert_eq!(intervals.len(), 1);
        assert_eq!((intervals[0].lo, intervals[0].hi), (0x400000, 0x400100));
        assert!(target_range.is_none());
        assert_eq!(debug, 2);
    }
}
