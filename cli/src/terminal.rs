//! Terminal color/verbosity detection and `tracing` subscriber setup.

pub(crate) fn no_color_env_requested() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty())
}

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM").map(|value| value.eq_ignore_ascii_case("dumb")).unwrap_or(false)
}

pub(crate) fn should_disable_color(no_color_flag: bool, no_color_env: bool, dumb_terminal: bool) -> bool {
    no_color_flag || no_color_env || dumb_terminal
}

/// Maps `-v`/`-q` occurrence counts to a tracing filter directive.
pub(crate) fn level_for(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

pub(crate) fn init_tracing(level: &str, no_color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).with_ansi(!no_color).with_env_filter(filter).try_init();
}
