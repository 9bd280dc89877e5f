use std::env;

use clap::Parser;

pub const NAME: &str = "shuntd";

#[derive(Parser, Debug, Clone)]
#[command(name = NAME, version = crate::version())]
#[command(about = "Per-application VPN split tunneling daemon")]
pub struct ShuntdOpts {
    /// Path of the configuration file
    #[arg(long, default_value = "/etc/shunt/shuntd.ini")]
    pub config_file: String,

    /// Pass many times for a more verbose output. Passing `-v` adds debug
    /// logs, `-vv` enables trace logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ShuntdOpts {
    pub fn override_log_level(&self) -> log::Level {
        match self.verbose {
            0 => log::Level::Info,
            1 => log::Level::Debug,
            2..=u8::MAX => log::Level::Trace,
        }
    }
}

pub fn parse_from_args() -> ShuntdOpts {
    ShuntdOpts::parse()
}

fn want_backtrace() -> bool {
    // Debug logging implies the user wants the full picture.
    log::max_level() >= log::LevelFilter::Debug
        || env::var("RUST_BACKTRACE").is_ok_and(|v| v == "1")
}

/// Log a fatal top-level error.
///
/// Normally the whole cause chain goes out on one line; under `-v` or
/// `RUST_BACKTRACE=1` we switch to the debug rendering, which includes
/// the backtrace when anyhow captured one.
pub fn report_error(e: &anyhow::Error) {
    if want_backtrace() {
        log::error!("{e:?}");
    } else {
        log::error!("{e:#}");
    }
}
