use std::fs;

use crate::config::ServerConfig;
use crate::path::join_paths;

pub const CAPS_TXT: &str = "caps.txt";
pub const ROBOTS_TXT: &str = "robots.txt";

/// Seed generated policy files into the cache for any that do not already
/// exist on disk under the root. Runs at startup before any worker, so no
/// locking subtleties apply.
pub fn cache_policy_files(config: &ServerConfig, description: &str, admin: &str, geoloc: &str) {
    let caps_abs = join_paths(&config.root, CAPS_TXT);
    if fs::metadata(&caps_abs).is_err() {
        config
            .cache
            .seed_generated(&caps_abs, generate_caps_txt(description, admin, geoloc));
        config.sys_log.info("", "Generated caps.txt");
    }

    let robots_abs = join_paths(&config.root, ROBOTS_TXT);
    if fs::metadata(&robots_abs).is_err() {
        config.cache.seed_generated(&robots_abs, generate_robots_txt());
        config.sys_log.info("", "Generated robots.txt");
    }
}

pub fn generate_caps_txt(description: &str, admin: &str, geoloc: &str) -> Vec<u8> {
    let mut text = String::new();
    text.push_str("CAPS\r\n");
    text.push_str("\r\n");
    text.push_str("# This is an automatically generated\r\n");
    text.push_str("# server policy file: caps.txt\r\n");
    text.push_str("\r\n");
    text.push_str("CapsVersion=1\r\n");
    text.push_str("ExpireCapsAfter=1800\r\n");
    text.push_str("\r\n");
    text.push_str("PathDelimeter=/\r\n");
    text.push_str("PathIdentity=.\r\n");
    text.push_str("PathParent=..\r\n");
    text.push_str("PathParentDouble=FALSE\r\n");
    text.push_str("PathEscapeCharacter=\\\r\n");
    text.push_str("PathKeepPreDelimeter=FALSE\r\n");
    text.push_str("\r\n");
    text.push_str(&format!("ServerSoftware={}\r\n", env!("CARGO_PKG_NAME")));
    text.push_str(&format!(
        "ServerSoftwareVersion={}\r\n",
        env!("CARGO_PKG_VERSION")
    ));
    text.push_str(&format!("ServerDescription={}\r\n", description));
    text.push_str(&format!("ServerGeolocationString={}\r\n", geoloc));
    text.push_str("\r\n");
    text.push_str(&format!("ServerAdmin={}\r\n", admin));
    text.into_bytes()
}

pub fn generate_robots_txt() -> Vec<u8> {
    let mut text = String::new();
    text.push_str("Usage-agent: *\r\n");
    text.push_str("Disallow: *\r\n");
    text.push_str("\r\n");
    text.push_str("Crawl-delay: 99999\r\n");
    text.push_str("\r\n");
    text.push_str("# This server does not support scraping\r\n");
    text.into_bytes()
}
