//! Process-wide tracing setup for binaries embedding a session.

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Keeps the non-blocking writer flushing; also marks init as done.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Media and socket crates that flood the log at debug level.
    const NOISY_DEPENDENCIES: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "interceptor",
        "tungstenite",
        "tokio_tungstenite",
    ];

    /// Installs the global subscriber. Later calls are no-ops.
    ///
    /// `PARLEY_LOG_FILTER` replaces the computed filter entirely;
    /// `PARLEY_TRACE_DEPS=1` keeps dependency logs at the requested level.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let filter = std::env::var("PARLEY_LOG_FILTER")
            .unwrap_or_else(|_| filter_directives(config.level, trace_dependencies()));

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        tracing::debug!(target: "parley::telemetry", %filter, "logging initialised");
        Ok(())
    }

    fn trace_dependencies() -> bool {
        std::env::var("PARLEY_TRACE_DEPS")
            .map(|value| !value.is_empty() && value != "0")
            .unwrap_or(false)
    }

    /// Parley's own targets all live under `parley::`.
    fn filter_directives(level: LogLevel, trace_deps: bool) -> String {
        let filter = LevelFilter::from(level);
        if level < LogLevel::Debug {
            return filter.to_string().to_lowercase();
        }
        let verbose = filter.to_string().to_lowercase();
        let dependencies = if trace_deps { verbose.as_str() } else { "info" };
        let mut directives = format!("{dependencies},parley={verbose}");
        if !trace_deps {
            for target in NOISY_DEPENDENCIES {
                directives.push_str(&format!(",{target}=info"));
            }
        }
        directives
    }

}
