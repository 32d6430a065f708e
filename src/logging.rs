use owo_colors::OwoColorize;

/// Enable the logger
pub fn enable_logger(verbose: bool) {
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}{}: {}",
                // Level messages are padded to keep the output looking somewhat sane
                match record.level() {
                    log::Level::Error => "ERROR".red().bold().to_string(),
                    log::Level::Warn => "WARN ".yellow().bold().to_string(),
                    log::Level::Info => "INFO ".green().bold().to_string(),
                    log::Level::Debug => "DEBUG".bright_blue().bold().to_string(),
                    log::Level::Trace => "TRACE".bright_white().bold().to_string(),
                },
                // Only show the crate name if verbose logging is enabled
                match verbose {
                    true => format!(
                        " [{}]",
                        record.target().split("::").next().unwrap_or_default()
                    )
                    .bright_black()
                    .to_string(),
                    false => String::new(),
                },
                message
            ));
        })
        .level(match verbose {
            true => log::LevelFilter::Debug,
            false => log::LevelFilter::Info,
        })
        .chain(std::io::stdout())
        .apply()
        .unwrap();
    if verbose {
        log::debug!("Verbose logging enabled");
    }
}
