//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

/// map the number of `-v` occurrences on the command line to a level,
/// defaulting to informational output
pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn initialize(verbosity: usize) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level(verbosity))
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::level;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level(0), tracing::Level::INFO);
        assert_eq!(level(1), tracing::Level::DEBUG);
        assert_eq!(level(2), tracing::Level::TRACE);
        assert_eq!(level(17), tracing::Level::TRACE);
    }
}
