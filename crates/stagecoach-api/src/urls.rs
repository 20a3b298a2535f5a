/// Query inputs for the download URL of an upload or one of its builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceUrlParams<'a> {
    pub upload_id: i64,
    pub build_id: Option<i64>,
    pub download_session_id: Option<&'a str>,
    pub download_key: Option<i64>,
}

/// URL layout of the package server's v1 API. The API key is part of the
/// path, so logged URLs go through [`ApiEndpoints::redact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    server: String,
    api_key: String,
}

impl ApiEndpoints {
    pub fn new(server: &str, api_key: &str) -> Self {
        Self {
            server: server.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn base(&self) -> String {
        format!("{}/api/1/{}", self.server, self.api_key)
    }

    pub fn download_sessions(&self, game_id: i64) -> String {
        format!("{}/games/{game_id}/download-sessions", self.base())
    }

    pub fn upgrade_path(
        &self,
        upload_id: i64,
        current_build_id: i64,
        download_key: Option<i64>,
    ) -> String {
        let url = format!(
            "{}/upload/{upload_id}/upgrade/{current_build_id}",
            self.base()
        );
        with_query(url, &[("download_key_id", download_key.map(|k| k.to_string()))])
    }

    /// Build archives are served from their own path; plain uploads from the
    /// upload download path.
    pub fn source_url(&self, params: &SourceUrlParams<'_>) -> String {
        let url = match params.build_id {
            Some(build_id) => format!(
                "{}/upload/{}/download/builds/{build_id}/archive",
                self.base(),
                params.upload_id
            ),
            None => format!("{}/upload/{}/download", self.base(), params.upload_id),
        };
        with_query(
            url,
            &[
                ("uuid", params.download_session_id.map(str::to_string)),
                (
                    "download_key_id",
                    params.download_key.map(|key| key.to_string()),
                ),
            ],
        )
    }

    pub fn redact(&self, url: &str) -> String {
        if self.api_key.is_empty() {
            return url.to_string();
        }
        url.replace(&format!("/api/1/{}/", self.api_key), "/api/1/<key>/")
    }
}

fn with_query(mut url: String, pairs: &[(&str, Option<String>)]) -> String {
    let mut separator = '?';
    for (key, value) in pairs {
        let Some(value) = value else {
            continue;
        };
        url.push(separator);
        url.push_str(key);
        url.push('=');
        url.push_str(&encode_query_value(value));
        separator = '&';
    }
    url
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
