// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request signing.
//!
//! A signed request carries the client date, application name and version,
//! and an HMAC-SHA256 over the canonical string
//! `"<app>\n<version>\n<date>\n<url>"`, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::SigningConfig;
use crate::utils::http_date;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_CLIENT_DATE: &str = "X-ClientDate";
pub const HEADER_APP_NAME: &str = "X-ApplicationName";
pub const HEADER_APP_VERSION: &str = "X-ApplicationVersion";
pub const HEADER_SIGNATURE: &str = "X-Stappler-Sign";

/// Signs outgoing requests with a shared secret.
#[derive(Clone)]
pub struct RequestSigner {
    config: SigningConfig,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("app_name", &self.config.app_name)
            .field("app_version", &self.config.app_version)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(config: SigningConfig) -> Self {
        Self { config }
    }

    /// Hex signature of `url` at `date` (an http-date string).
    pub fn signature(&self, url: &str, date: &str) -> String {
        let canonical = format!(
            "{}\n{}\n{}\n{}",
            self.config.app_name, self.config.app_version, date, url
        );
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(self.config.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signing headers for a request to `url` sent at `now` (microseconds).
    pub fn headers(&self, url: &str, now: i64) -> Vec<(String, String)> {
        let date = http_date(now);
        let signature = self.signature(url, &date);
        vec![
            (HEADER_CLIENT_DATE.to_string(), date),
            (HEADER_APP_NAME.to_string(), self.config.app_name.clone()),
            (HEADER_APP_VERSION.to_string(), self.config.app_version.clone()),
            (HEADER_SIGNATURE.to_string(), signature),
        ]
    }
}
