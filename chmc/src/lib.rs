pub mod abstract_cache;
pub mod analyser;
pub mod analysis_config;
pub mod cache_config;
pub mod cfg_dot;
pub mod chmc;
pub mod containers;
pub mod dataflow;
pub mod errors;
pub mod lifter;
pub mod memory_ref;
pub mod program;
pub mod resolver;
pub mod stack_height;
#[cfg(test)]
pub mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    use crate::errors::{ChmcError, Result};

    /// Sends records to the terminal, and additionally (as JSON) to a log file if one is given.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger> {
            use sloggers::Build;

            let debug_level = match debug_level {
                0 => sloggers::types::Severity::Warning,
                1 => sloggers::types::Severity::Info,
                2 => sloggers::types::Severity::Debug,
                _ => sloggers::types::Severity::Trace,
            };
            let build_error = |e: sloggers::Error| ChmcError::Logger(e.to_string());

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder
                    .build()
                    .map_err(build_error)?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() {
                        debug_level
                    } else {
                        sloggers::types::Severity::Error
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        sloggers::types::OverflowStrategy::Block
                    } else {
                        sloggers::types::OverflowStrategy::DropAndReport
                    })
                    .format(sloggers::types::Format::Compact)
                    .build()
                    .map_err(build_error)?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(sloggers::types::OverflowStrategy::Block)
                        .format(sloggers::types::Format::Json)
                        .build()
                        .map_err(build_error)?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> std::result::Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
