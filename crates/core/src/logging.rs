use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Quiets the native runtime unless the user asked for more.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tessera";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason.as_str()),
        }
    }
}

/// Filter precedence: explicit CLI filter > `-v`/`-vv` > `RUST_LOG` >
/// default. The noise filter is prepended only when the selection was
/// implicit, so an explicit filter can surface `ort` internals.
pub fn compose_log_filter(options: &LoggingInitOptions) -> String {
    let (user_filter, explicit) = if let Some(filter) = options.cli_log_filter.as_deref() {
        (filter.to_string(), true)
    } else if options.verbose >= 2 {
        ("trace".to_string(), true)
    } else if options.verbose == 1 {
        ("debug".to_string(), true)
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        (filter.to_string(), false)
    } else {
        (options.default_log_filter.clone(), false)
    };

    if !explicit && !options.noise_filter.trim().is_empty() {
        format!("{},{}", options.noise_filter, user_filter)
    } else {
        user_filter
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Install the global subscriber: console layer plus a daily-rolling file
/// sink when a data directory is configured and writable. Returns the
/// fallback reason when the file sink could not be set up.
pub fn init_logging(options: &LoggingInitOptions) -> Option<String> {
    let filter = compose_log_filter(options);

    match build_file_sink_plan(options) {
        FileSinkPlan::Ready { appender, .. } => {
            tracing_subscriber::registry()
                .with(EnvFilter::new(&filter))
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(appender))
                .init();
            None
        }
        FileSinkPlan::Fallback { reason, .. } => {
            tracing_subscriber::registry()
                .with(EnvFilter::new(&filter))
                .with(fmt::layer())
                .init();
            Some(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("tessera_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };
        assert_eq!(compose_log_filter(&options), "tessera_core=trace");
    }

    #[test]
    fn verbose_levels_map_to_debug_and_trace() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..Default::default()
        };
        assert_eq!(compose_log_filter(&debug), "debug");
        assert_eq!(compose_log_filter(&trace), "trace");
    }

    #[test]
    fn implicit_selection_prepends_noise_filter() {
        let env = LoggingInitOptions {
            rust_log_env: Some("warn,tessera_core=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(
            compose_log_filter(&env),
            "ort=error,warn,tessera_core=debug"
        );

        let default = LoggingInitOptions::default();
        assert_eq!(compose_log_filter(&default), "ort=error,info");
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert!(plan.is_ready());
        match plan {
            FileSinkPlan::Ready { log_dir, .. } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert!(log_dir.exists());
            }
            FileSinkPlan::Fallback { reason, .. } => panic!("expected ready sink: {reason}"),
        }
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan
            .fallback_reason()
            .unwrap()
            .contains("data_dir is not configured"));
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let data_dir_file = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir_file.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert!(plan
            .fallback_reason()
            .unwrap()
            .contains("failed to create log directory"));
    }
}
