use std::path::PathBuf;

/// Default config file: `~/.config/pvectl/config.toml`
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("pvectl")
        .join("config.toml")
}

/// Local data directory: `~/.local/share/pvectl/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pvectl")
}

/// Per-task logs of watched tasks: `~/.local/share/pvectl/logs/`
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Debug trace of the most recent invocations.
pub fn trace_log_path() -> PathBuf {
    data_dir().join("pvectl.log")
}
