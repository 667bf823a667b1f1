use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Result;

const DEFAULT_GLYPH_BASE_URL: &str =
    "https://cdn.jsdelivr.net/gh/twitter/twemoji@14.0.2/assets/72x72";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub work_root: PathBuf,
    pub glyph_cache_dir: PathBuf,
    pub glyph_base_url: String,
    pub glyph_size: String,
    pub glyph_fetch_timeout_seconds: u64,
    pub concurrency_limit: usize,
    pub artifact_retention_seconds: u64,
    pub record_retention_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub tool_timeout_seconds: u64,
    pub queue_slot_seconds: u64,
    pub max_upload_bytes: usize,
    pub pandoc_bin: String,
    pub reference_doc: Option<PathBuf>,
    pub lua_filters: Vec<PathBuf>,
    pub soffice_bin: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("NOTES_CONVERT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let work_root = PathBuf::from(
            env::var("NOTES_CONVERT_WORK_ROOT").unwrap_or_else(|_| "/tmp/notes-convert".to_string()),
        );

        let glyph_cache_dir = non_empty_var("NOTES_CONVERT_GLYPH_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_root.join("glyphs"));

        let glyph_base_url = non_empty_var("NOTES_CONVERT_GLYPH_BASE_URL")
            .unwrap_or_else(|| DEFAULT_GLYPH_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let reference_doc = non_empty_var("NOTES_CONVERT_REFERENCE_DOC").map(PathBuf::from);

        let lua_filters = non_empty_var("NOTES_CONVERT_LUA_FILTERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let record_retention_seconds = env_or("NOTES_CONVERT_RECORD_RETENTION_SECONDS", 24 * 60 * 60);

        Ok(Self {
            bind_addr,
            work_root,
            glyph_cache_dir,
            glyph_base_url,
            glyph_size: non_empty_var("NOTES_CONVERT_GLYPH_SIZE").unwrap_or_else(|| "1em".to_string()),
            glyph_fetch_timeout_seconds: env_or("NOTES_CONVERT_GLYPH_FETCH_TIMEOUT_SECONDS", 10),
            concurrency_limit: env_or("NOTES_CONVERT_CONCURRENCY", 1usize).max(1),
            artifact_retention_seconds: env_or("NOTES_CONVERT_ARTIFACT_RETENTION_SECONDS", 60 * 60),
            record_retention_seconds,
            cleanup_interval_seconds: env_or("NOTES_CONVERT_CLEANUP_INTERVAL_SECONDS", 60u64).max(1),
            tool_timeout_seconds: env_or("NOTES_CONVERT_TOOL_TIMEOUT_SECONDS", 5 * 60),
            queue_slot_seconds: env_or("NOTES_CONVERT_QUEUE_SLOT_SECONDS", 30),
            max_upload_bytes: env_or("NOTES_CONVERT_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            pandoc_bin: non_empty_var("NOTES_CONVERT_PANDOC_BIN").unwrap_or_else(|| "pandoc".to_string()),
            reference_doc,
            lua_filters,
            soffice_bin: non_empty_var("NOTES_CONVERT_SOFFICE_BIN")
                .unwrap_or_else(|| "soffice".to_string()),
        })
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn glyph_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.glyph_fetch_timeout_seconds)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl Config {
    pub fn for_tests(work_root: &std::path::Path) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            work_root: work_root.to_path_buf(),
            glyph_cache_dir: work_root.join("glyphs"),
            glyph_base_url: "http://glyphs.invalid".to_string(),
            glyph_size: "1em".to_string(),
            glyph_fetch_timeout_seconds: 1,
            concurrency_limit: 1,
            artifact_retention_seconds: 60 * 60,
            record_retention_seconds: 24 * 60 * 60,
            cleanup_interval_seconds: 60,
            tool_timeout_seconds: 5,
            queue_slot_seconds: 30,
            max_upload_bytes: 1024 * 1024,
            pandoc_bin: "pandoc".to_string(),
            reference_doc: None,
            lua_filters: Vec::new(),
            soffice_bin: "soffice".to_string(),
        }
    }
}
