use clap::{Args, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

/// Logging flags shared by the workspace binaries. Flatten into a parser.
#[derive(Debug, Clone, Args)]
pub struct LoggingOpts {
    #[arg(long, env = "RDMA_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, env = "RDMA_LOG_COLOR", value_enum, default_value_t = LogColor::Auto)]
    pub log_color: LogColor,

    /// Default directive in RUST_LOG syntax, e.g. `rdma_lib=debug`.
    /// RUST_LOG takes priority for targets both mention.
    #[arg(long = "log")]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self { log_format: LogFormat::Text, log_color: LogColor::Auto, log_directives: None }
    }
}

impl LoggingOpts {
    fn ansi(&self) -> bool {
        match self.log_color {
            // The subscriber below writes to stderr.
            LogColor::Auto => std::io::stderr().is_terminal(),
            LogColor::Always => true,
            LogColor::Never => false,
        }
    }

    fn filter(&self) -> Result<EnvFilter, anyhow::Error> {
        let mut builder = EnvFilter::builder();
        if let Some(directives) = &self.log_directives {
            builder = builder.with_default_directive(directives.parse()?);
        }
        Ok(builder.from_env_lossy())
    }
}

/// Installs the global tracing subscriber and routes `log` records into it.
pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(opts.filter()?)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(opts.ansi()).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    dispatcher::set_global_default(dispatch)?;

    // Must run after the global default is set to pick up its max level.
    tracing_log::LogTracer::builder()
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        logging: LoggingOpts,
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["bin", "--log-format", "json", "--log-color", "never"]);
        assert_eq!(cli.logging.log_format, LogFormat::Json);
        assert_eq!(cli.logging.log_color, LogColor::Never);
        assert!(!cli.logging.ansi());
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let opts =
            LoggingOpts { log_directives: Some("rdma_lib=loudest".into()), ..Default::default() };
        assert!(opts.filter().is_err());
    }
}
