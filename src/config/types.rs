use serde::{Deserialize, Serialize};

/// Flat configuration, loaded from TOML and overridable per key through
/// `IKUP_*` environment variables. Options that accept "auto" are kept as
/// strings and parsed where they are used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // Id allocation options.
    pub id_space: String,
    pub id_subspace: String,
    pub max_num_ids: u32,
    pub max_ids_per_subspace: u32,
    pub id_database_dir: String,

    // Image geometry options.
    /// Cell size in pixels as "WxH", or "auto" to probe the terminal.
    pub cell_size: String,
    pub default_cell_size: String,
    pub scale: f32,
    pub global_scale: f32,
    /// Max columns/rows for automatically computed boxes; "auto" uses the
    /// terminal size.
    pub max_cols: String,
    pub max_rows: String,
    pub fallback_max_cols: u32,
    pub fallback_max_rows: u32,

    // Uploading options.
    /// Base64 bytes per graphics command chunk.
    pub chunk_size: usize,
    pub upload_method: String,
    pub file_max_size: u64,
    pub stream_max_size: u64,
    pub force_upload: bool,
    pub mark_uploaded: bool,
    /// Formats the terminal can decode, comma separated, or "auto".
    pub supported_formats: String,
    pub reupload_max_uploads_ago: i64,
    pub reupload_max_bytes_ago: u64,
    pub reupload_max_seconds_ago: i64,

    // Terminal identification options.
    pub terminal_name: String,
    pub terminal_id: String,
    pub session_id: String,

    // Cleanup options.
    pub max_db_age_days: u32,
    pub cleanup_probability: f64,
    pub db_lock_timeout_ms: u64,

    // Parallel upload options.
    pub upload_progress_update_interval: f64,
    pub upload_stall_timeout: f64,
    pub allow_concurrent_uploads: String,
    /// Artificial delay between graphics commands, for testing stalls.
    pub upload_command_delay: f64,

    // Transcode cache options.
    pub cache_dir: String,
    pub thumbnail_file_size_tolerance: f64,
    pub max_cached_images: u64,
    pub max_cache_size_bytes: u64,
    pub cache_cleanup_target: f64,
}

fn default_id_space() -> String {
    "8bit_diacritic".to_string()
}

fn default_id_subspace() -> String {
    "0:256".to_string()
}

fn default_id_database_dir() -> String {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|p| p.join("ikup").to_string_lossy().into_owned())
        .unwrap_or_else(|| "/tmp/ikup".to_string())
}

fn default_cache_dir() -> String {
    dirs::cache_dir()
        .map(|p| p.join("ikup").to_string_lossy().into_owned())
        .unwrap_or_else(|| "/tmp/ikup-cache".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id_space: default_id_space(),
            id_subspace: default_id_subspace(),
            max_num_ids: 4096,
            max_ids_per_subspace: 1024,
            id_database_dir: default_id_database_dir(),

            cell_size: "auto".to_string(),
            default_cell_size: "8x16".to_string(),
            scale: 1.0,
            global_scale: 1.0,
            max_cols: "auto".to_string(),
            max_rows: "auto".to_string(),
            fallback_max_cols: 80,
            fallback_max_rows: 24,

            chunk_size: 3968,
            upload_method: "auto".to_string(),
            file_max_size: 10 * 1024 * 1024,
            stream_max_size: 2 * 1024 * 1024,
            force_upload: false,
            mark_uploaded: true,
            supported_formats: "auto".to_string(),
            reupload_max_uploads_ago: 1024,
            reupload_max_bytes_ago: 20 * 1024 * 1024,
            reupload_max_seconds_ago: 3600,

            terminal_name: String::new(),
            terminal_id: String::new(),
            session_id: String::new(),

            max_db_age_days: 7,
            cleanup_probability: 0.01,
            db_lock_timeout_ms: 10_000,

            upload_progress_update_interval: 0.2,
            upload_stall_timeout: 2.0,
            allow_concurrent_uploads: "auto".to_string(),
            upload_command_delay: 0.0,

            cache_dir: default_cache_dir(),
            thumbnail_file_size_tolerance: 0.2,
            max_cached_images: 4096,
            max_cache_size_bytes: 300 * 1024 * 1024,
            cache_cleanup_target: 0.8,
        }
    }
}
