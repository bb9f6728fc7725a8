use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Install the env_logger backend. `RUST_LOG` wins when set; otherwise only
/// warnings and errors are shown. Calling it twice is harmless.
pub fn init_logger() {
    init_logger_with_default(LevelFilter::Warn);
}

/// Same as [`init_logger`] with a different fallback level when `RUST_LOG`
/// is unset.
pub fn init_logger_with_default(level: LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(level);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}: {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

fn crash_log_path() -> MutexGuard<'static, Option<PathBuf>> {
    CRASH_LOG_PATH.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record panics and critical errors under the local data directory.
pub fn init_crash_logger() {
    let log_dir = dirs::data_local_dir()
        .map(|dir| dir.join("probe-link"))
        .unwrap_or_else(|| PathBuf::from("."));
    let log_path = set_crash_log_dir(&log_dir);

    std::panic::set_hook(Box::new(|panic_info| {
        let crash_msg = format_panic_message(panic_info);
        if let Err(e) = write_crash_log(&crash_msg) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }
        error!("\n{}", crash_msg);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

/// Send crash records to `dir/crash.log` from now on.
pub fn set_crash_log_dir(dir: &Path) -> PathBuf {
    let _ = fs::create_dir_all(dir);
    let log_path = dir.join("crash.log");
    *crash_log_path() = Some(log_path.clone());
    log_path
}

fn format_panic_message(panic_info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "Unknown location".to_string());

    format!(
        r#"
===== PANIC =====
Timestamp: {}
Location: {}
Message: {}
Thread: {:?}

Backtrace:
{:?}

"#,
        timestamp,
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::capture()
    )
}

fn write_crash_log(message: &str) -> std::io::Result<()> {
    if let Some(log_path) = crash_log_path().as_ref() {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        writeln!(file, "{}", message)?;
    }
    Ok(())
}

/// Log an error that leaves the client unusable, and append it to the
/// crash log when one is set up.
pub fn log_critical_error(context: &str, error: &str) {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let message = format!(
        r#"
===== CRITICAL ERROR =====
Timestamp: {}
Context: {}
Error: {}
Thread: {:?}
"#,
        timestamp,
        context,
        error,
        std::thread::current().name().unwrap_or("unnamed")
    );

    if let Err(e) = write_crash_log(&message) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }

    error!("[{}] {}", context, error);
}

pub fn get_crash_log_path() -> Option<PathBuf> {
    crash_log_path().clone()
}

pub fn clear_crash_log() -> std::io::Result<()> {
    if let Some(log_path) = crash_log_path().as_ref() {
        if log_path.exists() {
            fs::remove_file(log_path)?;
        }
    }
    Ok(())
}
