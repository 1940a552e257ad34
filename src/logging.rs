use log::LevelFilter;
use simplelog::ColorChoice;
use simplelog::ConfigBuilder;
use simplelog::LevelPadding;
use simplelog::TermLogger;
use simplelog::TerminalMode;

use crate::communication::Rank;

fn get_log_level(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        2 => LevelFilter::Trace,
        v => unimplemented!("Unsupported verbosity level: {}", v),
    }
}

/// Set up terminal logging for a runtime binary. Only the main rank
/// logs; repeated calls are ignored, which makes this safe to call
/// from tests.
pub fn setup_logging(rank: Rank, verbosity: usize) {
    let level = if rank == 0 {
        get_log_level(verbosity)
    } else {
        LevelFilter::Off
    };
    let config = ConfigBuilder::default()
        .set_level_padding(LevelPadding::Right)
        .set_thread_level(LevelFilter::Off)
        .build();
    let _ = TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto);
}
