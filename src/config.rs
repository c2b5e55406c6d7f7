use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 监听地址，留空回落到 127.0.0.1。
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 近端上游：延迟低，但对境外域名的应答可能被注入。
    #[serde(default = "default_fast_dns")]
    pub fast_dns: String,
    /// 可信上游：不受注入影响，延迟较高。
    #[serde(default = "default_clean_dns")]
    pub clean_dns: String,
    /// 应答缓存与域名提示各自的容量（条数）。
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            fast_dns: default_fast_dns(),
            clean_dns: default_clean_dns(),
            cache_size: default_cache_size(),
        }
    }
}

impl Config {
    /// Apply the address normalization rules. Must run before the addresses
    /// are parsed or handed to a socket.
    pub fn normalize(mut self) -> Self {
        if self.listen.is_empty() {
            self.listen = "127.0.0.1".to_string();
        }
        self.listen = append_default_port(&self.listen);
        self.fast_dns = append_default_port(&self.fast_dns);
        self.clean_dns = append_default_port(&self.clean_dns);
        self
    }
}

/// 为缺端口的 IPv4 字面量补 :53；IPv6 的字符串表示难以判断端口，原样返回。
pub fn append_default_port(addr: &str) -> String {
    if addr.contains('.') && !addr.contains(':') {
        return format!("{addr}:53");
    }
    addr.to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    info!(target = "config", path = %path.display(), "config loaded");
    Ok(cfg)
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_fast_dns() -> String {
    "114.114.114.114".to_string()
}

fn default_clean_dns() -> String {
    "8.8.8.8".to_string()
}

fn default_cache_size() -> u64 {
    4096
}
