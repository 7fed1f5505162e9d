// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal output: log formatting, color selection and the styles used by commands.

use clap::{Args, ValueEnum};
use owo_colors::{OwoColorize, Style, style};
use std::fmt;
use supports_color::Stream;
use testrelay_runner::dispatcher::NO_HEADING_TARGET;
use tracing::{Event, Level, Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding log directives, in `tracing_subscriber` `Targets` syntax.
pub(crate) const LOG_ENV: &str = "TESTRELAY_LOG";

#[derive(Copy, Clone, Debug, Args)]
pub(crate) struct OutputOpts {
    /// Verbose output: show protocol traffic and tracker calls
    #[arg(long, short, global = true, env = "TESTRELAY_VERBOSE")]
    verbose: bool,

    /// When to color output
    #[arg(
        long,
        value_enum,
        default_value_t,
        global = true,
        value_name = "WHEN",
        env = "TESTRELAY_COLOR"
    )]
    color: ColorChoice,
}

impl OutputOpts {
    /// Resolves the options and installs the stderr logger.
    pub(crate) fn init(self) -> OutputContext {
        let output = OutputContext {
            verbose: self.verbose,
            color: self.color,
        };
        output.install_logger();
        output
    }
}

/// Output settings resolved from the command line.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct OutputContext {
    pub(crate) verbose: bool,
    pub(crate) color: ColorChoice,
}

impl OutputContext {
    /// Returns the styles for error reports on stderr.
    pub fn stderr_styles(&self) -> StderrStyles {
        if self.color.enabled_for(Stream::Stderr) {
            StderrStyles::colored()
        } else {
            StderrStyles::default()
        }
    }

    /// Returns the styles for the launch summary on stdout.
    pub(crate) fn stdout_styles(&self) -> SummaryStyles {
        if self.color.enabled_for(Stream::Stdout) {
            SummaryStyles::colored()
        } else {
            SummaryStyles::default()
        }
    }

    fn install_logger(&self) {
        let default_level = if self.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let (targets, invalid) =
            parse_log_directives(std::env::var(LOG_ENV).ok().as_deref(), default_level);

        let layer = tracing_subscriber::fmt::layer()
            .event_format(RelayFormatter {
                colored: self.color.enabled_for(Stream::Stderr),
            })
            .with_writer(std::io::stderr)
            .with_filter(targets);

        // A logger may already be installed when commands run in-process under tests.
        if tracing_subscriber::registry().with(layer).try_init().is_ok() {
            if let Some(invalid) = invalid {
                tracing::warn!("ignoring invalid {LOG_ENV} value `{invalid}`");
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn enabled_for(self, stream: Stream) -> bool {
        match self {
            Self::Auto => supports_color::on_cached(stream).is_some(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Formats testrelay's log events for a terminal.
///
/// Each line gets a level heading (`error:`, `warning:`, ...). Debug and trace lines also name
/// their target, since those carry protocol traffic from several modules. Events sent to
/// [`NO_HEADING_TARGET`] are the test process's own report text and are printed as-is.
struct RelayFormatter {
    colored: bool,
}

impl RelayFormatter {
    fn heading(&self, level: Level) -> (&'static str, Style) {
        let (heading, heading_style) = match level {
            Level::ERROR => ("error", style().red().bold()),
            Level::WARN => ("warning", style().yellow().bold()),
            Level::INFO => ("info", style().bold()),
            Level::DEBUG => ("debug", style().blue()),
            Level::TRACE => ("trace", style().dimmed()),
        };
        (heading, if self.colored { heading_style } else { Style::new() })
    }
}

impl<S, N> FormatEvent<S, N> for RelayFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != NO_HEADING_TARGET {
            let level = *metadata.level();
            let (heading, heading_style) = self.heading(level);
            write!(writer, "{}", heading.style(heading_style))?;
            if level >= Level::DEBUG {
                write!(writer, " [{}]", metadata.target())?;
            }
            write!(writer, ": ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Parses log directives, falling back to `default_level` if they're missing or invalid.
///
/// Returns the invalid directives alongside, so they can be reported once logging is up.
fn parse_log_directives(
    directives: Option<&str>,
    default_level: LevelFilter,
) -> (Targets, Option<String>) {
    let default = || Targets::new().with_default(default_level);
    match directives {
        None | Some("") => (default(), None),
        Some(directives) => match directives.parse::<Targets>() {
            Ok(targets) => (targets, None),
            Err(_) => (default(), Some(directives.to_owned())),
        },
    }
}

/// Styles for error reports printed to stderr.
#[derive(Debug, Default)]
pub struct StderrStyles {
    pub(crate) bold: Style,
    pub(crate) warning_text: Style,
}

impl StderrStyles {
    fn colored() -> Self {
        Self {
            bold: style().bold(),
            warning_text: style().yellow(),
        }
    }
}

/// Styles for the per-group summary printed after a launch.
#[derive(Debug, Default)]
pub(crate) struct SummaryStyles {
    pub(crate) pass: Style,
    pub(crate) fail: Style,
    pub(crate) skip: Style,
    pub(crate) count: Style,
}

impl SummaryStyles {
    fn colored() -> Self {
        Self {
            pass: style().green().bold(),
            fail: style().red().bold(),
            skip: style().yellow().bold(),
            count: style().bold(),
        }
    }
}
