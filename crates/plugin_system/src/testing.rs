//! Test helpers: in-memory transport and plugin archive builders.

use crate::error::PluginError;
use crate::transport::{ByteStream, HttpTransport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Builds a zip archive holding the given `(path, contents)` entries.
pub fn build_jar(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (path, contents) in entries {
        writer.start_file(*path, options).expect("start zip entry");
        writer.write_all(contents.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Builds a minimal Bukkit plugin JAR.
pub fn build_plugin_jar(name: &str, version: &str) -> Vec<u8> {
    let manifest = format!(
        "name: {}\nversion: '{}'\nmain: com.example.{}\ndescription: Test plugin {}\nauthor: tester\n",
        name, version, name, name
    );
    build_jar(&[
        ("plugin.yml", manifest.as_str()),
        ("com/example/Main.class", "cafebabe"),
    ])
}

#[derive(Clone)]
enum Route {
    Json(serde_json::Value),
    Bytes { data: Vec<u8>, delay: Duration },
    Stalled { content_length: u64 },
    Fail(fn(String) -> PluginError),
}

/// [`HttpTransport`] answering from a fixed routing table.
#[derive(Default)]
pub struct StaticTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: AtomicUsize,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve_json(&self, url: &str, value: serde_json::Value) {
        self.routes.lock().insert(url.to_string(), Route::Json(value));
    }

    pub fn serve_bytes(&self, url: &str, data: Vec<u8>) {
        self.serve_bytes_slowly(url, data, Duration::ZERO);
    }

    /// Serves `data` after waiting `delay`, to keep a job busy.
    pub fn serve_bytes_slowly(&self, url: &str, data: Vec<u8>, delay: Duration) {
        self.routes
            .lock()
            .insert(url.to_string(), Route::Bytes { data, delay });
    }

    /// Announces `content_length` bytes and then never sends any.
    pub fn serve_stalled(&self, url: &str, content_length: u64) {
        self.routes
            .lock()
            .insert(url.to_string(), Route::Stalled { content_length });
    }

    pub fn fail_with(&self, url: &str, error: fn(String) -> PluginError) {
        self.routes.lock().insert(url.to_string(), Route::Fail(error));
    }

    /// Number of requests answered so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn route(&self, url: &Url) -> Result<Route, PluginError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| PluginError::Network(format!("download {} returned status 404 Not Found", url)))
    }
}

#[async_trait]
impl HttpTransport for StaticTransport {
    async fn get_json(&self, url: &Url) -> Result<serde_json::Value, PluginError> {
        match self.route(url)? {
            Route::Json(value) => Ok(value),
            Route::Bytes { data, .. } => serde_json::from_slice(&data)
                .map_err(|e| PluginError::Network(format!("invalid JSON from {}: {}", url, e))),
            Route::Stalled { .. } => Err(PluginError::DownloadTimeout(format!("lookup {} stalled", url))),
            Route::Fail(make) => Err(make(url.to_string())),
        }
    }

    async fn get_stream(&self, url: &Url) -> Result<ByteStream, PluginError> {
        match self.route(url)? {
            Route::Bytes { data, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let content_length = Some(data.len() as u64);
                let chunks: Vec<Result<Bytes, PluginError>> = data
                    .chunks(512)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(ByteStream {
                    content_length,
                    body: stream::iter(chunks).boxed(),
                })
            }
            Route::Stalled { content_length } => Ok(ByteStream {
                content_length: Some(content_length),
                body: stream::pending().boxed(),
            }),
            Route::Json(value) => {
                let data = serde_json::to_vec(&value).unwrap_or_default();
                Ok(ByteStream {
                    content_length: Some(data.len() as u64),
                    body: stream::iter(vec![Ok(Bytes::from(data))]).boxed(),
                })
            }
            Route::Fail(make) => Err(make(url.to_string())),
        }
    }
}
