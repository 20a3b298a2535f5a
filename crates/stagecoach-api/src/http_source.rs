use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use stagecoach_installer::{
    ByteSource, CancelToken, CancellableReader, LocalSourceOpener, SourceOpener,
};

use crate::client::ApiSettings;

type BodyReader = CancellableReader<Response>;

/// Remote install source read over HTTP. Seeking drops the current response
/// and the next read reopens it with a `Range` request at the new offset.
pub struct HttpSource {
    client: Client,
    url: String,
    name: String,
    size: u64,
    position: u64,
    body: Option<BodyReader>,
    cancel: CancelToken,
}

impl HttpSource {
    pub fn open(client: Client, url: &str, cancel: CancelToken) -> Result<Self> {
        cancel.check("source acquisition")?;
        debug!(url = %redact_query(url), "opening remote install source");
        let response = client
            .get(url)
            .send()
            .with_context(|| format!("failed to request {}", redact_query(url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "failed to open {}: server returned {status}",
                redact_query(url)
            ));
        }

        let size = content_range_total(header_str(&response, CONTENT_RANGE))
            .or_else(|| header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()))
            .or_else(|| response.content_length())
            .ok_or_else(|| anyhow!("server did not report a size for {}", redact_query(url)))?;
        let name = header_str(&response, CONTENT_DISPOSITION)
            .and_then(content_disposition_file_name)
            .unwrap_or_else(|| url_file_name(url));

        Ok(Self {
            client,
            url: url.to_string(),
            name,
            size,
            position: 0,
            body: Some(CancellableReader::new(response, cancel.clone(), "download")),
            cancel,
        })
    }

    fn reopen_at(&mut self, offset: u64) -> io::Result<BodyReader> {
        if self.cancel.is_cancelled() {
            return Err(self.cancel.io_error("download"));
        }
        debug!(url = %redact_query(&self.url), offset, "resuming remote read");
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .map_err(io::Error::other)?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                Ok(CancellableReader::new(response, self.cancel.clone(), "download"))
            }
            StatusCode::OK => {
                // Range ignored: skip to the offset by hand.
                let mut reader = CancellableReader::new(response, self.cancel.clone(), "download");
                let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
                if skipped < offset {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("remote source ended at {skipped} while seeking to {offset}"),
                    ));
                }
                Ok(reader)
            }
            status => Err(io::Error::other(format!(
                "range request at {offset} failed with status {status}"
            ))),
        }
    }
}

impl Read for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let mut body = match self.body.take() {
            Some(body) => body,
            None => self.reopen_at(self.position)?,
        };
        let read = body.read(buf)?;
        self.position += read as u64;
        self.body = Some(body);
        Ok(read)
    }
}

impl Seek for HttpSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;

        if target != self.position {
            self.body = None;
            self.position = target;
        }
        Ok(self.position)
    }
}

impl ByteSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn local_path(&self) -> Option<&Path> {
        None
    }
}

/// Opens `http(s)://` locations remotely and everything else from disk.
#[derive(Clone)]
pub struct HttpSourceOpener {
    client: Client,
}

impl HttpSourceOpener {
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        Ok(Self {
            client: settings.build_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl SourceOpener for HttpSourceOpener {
    fn open(&self, location: &str, cancel: &CancelToken) -> Result<Box<dyn ByteSource>> {
        if is_remote_location(location) {
            return Ok(Box::new(HttpSource::open(
                self.client.clone(),
                location,
                cancel.clone(),
            )?));
        }
        LocalSourceOpener.open(location, cancel)
    }
}

pub fn is_remote_location(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|value| value.to_str().ok())
}

/// Total from `bytes 0-99/1234`; `None` for `*` totals.
pub(crate) fn content_range_total(value: Option<&str>) -> Option<u64> {
    let value = value?.trim();
    let rest = value.strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

pub(crate) fn content_disposition_file_name(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let (key, raw) = part.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"').trim();
        let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
        (!name.is_empty()).then(|| name.to_string())
    })
}

pub(crate) fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("download")
        .to_string()
}

fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
