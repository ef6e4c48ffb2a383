use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Installs the crate's logger.
///
/// Timestamped, target-tagged lines on stdout, with an optional file sink
/// and optional ANSI colouring for interactive terminals.
pub fn init(level: LevelFilter, log_file: Option<&str>, pretty: bool) -> anyhow::Result<()> {
    let mut colours = ColoredLevelConfig::new();

    if pretty {
        colours = colours
            .info(Color::Green)
            .warn(Color::Yellow)
            .error(Color::BrightRed)
            .debug(Color::Magenta)
            .trace(Color::Cyan);
    }

    let mut builder = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} | {} | {:<5} - {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colours.color(record.level()),
                message,
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(file) = log_file {
        builder = builder.chain(fern::log_file(file)?);
    }

    builder.apply()?;

    Ok(())
}
