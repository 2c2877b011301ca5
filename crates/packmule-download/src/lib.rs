//! The downloader capability: a single `fetch` operation, an HTTP
//! implementation with byte-range resume, and a fixture-backed mock for
//! deterministic tests without network.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use packmule_hash::StreamingHasher;

/// Minimum interval between progress callback invocations. Progress is
/// advisory — callers must not rely on exact delivery timing or count.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub target_path: &'a Path,
    /// Expected SHA-256, lowercase hex. When present, a mismatch after the
    /// transfer completes is a failure and `target_path` is removed.
    pub expected_sha256: Option<&'a str>,
    /// If true and a partial file already exists at `target_path`, resume
    /// from its current length via a byte-range request.
    pub resume: bool,
    pub progress: Option<&'a dyn Fn(Progress)>,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub resumed: bool,
    pub sha256: String,
    /// The server-advertised `Content-Length`, adjusted for a resumed
    /// transfer's already-present prefix, if the header was present.
    pub content_length: Option<u64>,
}

pub trait Downloader: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome>;
}

/// HTTP implementation backed by a blocking `reqwest` client.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("packmule/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new().expect("default HTTP client configuration is always valid")
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome> {
        if let Some(parent) = request.target_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory {}", parent.display())
            })?;
        }

        let existing_len = if request.resume {
            std::fs::metadata(request.target_path)
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };

        let mut req = self.client.get(request.url);
        if existing_len > 0 {
            req = req.header("Range", format!("bytes={existing_len}-"));
        }

        let mut response = req
            .send()
            .with_context(|| format!("request failed for {}", request.url))?;

        if !response.status().is_success() {
            bail!(
                "unexpected status {} fetching {}",
                response.status(),
                request.url
            );
        }

        let resumed = existing_len > 0 && response.status().as_u16() == 206;
        let total_bytes = response
            .content_length()
            .map(|len| if resumed { len + existing_len } else { len });

        let mut hasher = StreamingHasher::new();
        let mut file = if resumed {
            hasher
                .update_from_file(request.target_path)
                .context("failed to re-derive hash over existing partial file")?;
            OpenOptions::new()
                .append(true)
                .open(request.target_path)
                .with_context(|| {
                    format!("failed to open {} for append", request.target_path.display())
                })?
        } else {
            File::create(request.target_path)
                .with_context(|| format!("failed to create {}", request.target_path.display()))?
        };

        let mut written = if resumed { existing_len } else { 0 };
        let mut buf = vec![0u8; packmule_hash::CHUNK_SIZE];
        let mut last_progress = Instant::now() - PROGRESS_INTERVAL;

        loop {
            let n = response
                .read(&mut buf)
                .with_context(|| format!("read failed while fetching {}", request.url))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .with_context(|| format!("write failed for {}", request.target_path.display()))?;
            hasher.update(&buf[..n]);
            written += n as u64;

            if let Some(progress) = request.progress {
                let now = Instant::now();
                if now.duration_since(last_progress) >= PROGRESS_INTERVAL {
                    progress(Progress {
                        bytes_downloaded: written,
                        total_bytes,
                    });
                    last_progress = now;
                }
            }
        }

        file.sync_all()
            .with_context(|| format!("failed to fsync {}", request.target_path.display()))?;
        drop(file);

        if let Some(progress) = request.progress {
            progress(Progress {
                bytes_downloaded: written,
                total_bytes,
            });
        }

        let sha256 = hasher.finalize_hex();

        if let Some(expected) = request.expected_sha256
            && !expected.eq_ignore_ascii_case(&sha256)
        {
            let _ = std::fs::remove_file(request.target_path);
            bail!(
                "checksum mismatch for {}: expected {expected}, got {sha256}",
                request.url
            );
        }

        Ok(FetchOutcome {
            bytes_written: written,
            resumed,
            sha256,
            content_length: total_bytes,
        })
    }
}

/// Fixture-backed mock. Looks up `basename(url)` in `fixture_dir` and copies
/// it to `target_path`, performing the same hash check as the HTTP
/// implementation. Used to exercise the updater deterministically without a
/// network dependency.
pub struct MockDownloader {
    fixture_dir: PathBuf,
}

impl MockDownloader {
    pub fn new(fixture_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixture_dir: fixture_dir.into(),
        }
    }

    fn fixture_path(&self, url: &str) -> Result<PathBuf> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .with_context(|| format!("cannot derive fixture name from url {url}"))?;
        Ok(self.fixture_dir.join(name))
    }
}

impl Downloader for MockDownloader {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome> {
        let fixture = self.fixture_path(request.url)?;
        let data = std::fs::read(&fixture)
            .with_context(|| format!("fixture not found for {}: {}", request.url, fixture.display()))?;

        if let Some(parent) = request.target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(request.target_path, &data)
            .with_context(|| format!("failed to write {}", request.target_path.display()))?;

        let sha256 = packmule_hash::hash_bytes(&data);

        if let Some(expected) = request.expected_sha256
            && !expected.eq_ignore_ascii_case(&sha256)
        {
            let _ = std::fs::remove_file(request.target_path);
            bail!(
                "checksum mismatch for {}: expected {expected}, got {sha256}",
                request.url
            );
        }

        if let Some(progress) = request.progress {
            progress(Progress {
                bytes_downloaded: data.len() as u64,
                total_bytes: Some(data.len() as u64),
            });
        }

        Ok(FetchOutcome {
            bytes_written: data.len() as u64,
            resumed: false,
            sha256,
            content_length: Some(data.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;
    use tiny_http::{Header, Response, Server};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn mock_downloader_copies_fixture_and_verifies_hash() {
        let fixtures = tempdir().unwrap();
        std::fs::write(fixtures.path().join("tool.bin"), b"fixture content").unwrap();
        let dl = MockDownloader::new(fixtures.path());

        let target_dir = tempdir().unwrap();
        let target = target_dir.path().join("out.bin");
        let expected = packmule_hash::hash_bytes(b"fixture content");

        let outcome = dl
            .fetch(&FetchRequest {
                url: "https://example.test/files/tool.bin",
                target_path: &target,
                expected_sha256: Some(&expected),
                resume: false,
                progress: None,
            })
            .unwrap();

        assert_eq!(outcome.bytes_written, 15);
        assert_eq!(std::fs::read(&target).unwrap(), b"fixture content");
    }

    #[test]
    fn mock_downloader_rejects_hash_mismatch_and_removes_target() {
        let fixtures = tempdir().unwrap();
        std::fs::write(fixtures.path().join("tool.bin"), b"fixture content").unwrap();
        let dl = MockDownloader::new(fixtures.path());

        let target_dir = tempdir().unwrap();
        let target = target_dir.path().join("out.bin");

        let result = dl.fetch(&FetchRequest {
            url: "https://example.test/files/tool.bin",
            target_path: &target,
            expected_sha256: Some("0000000000000000000000000000000000000000000000000000000000000"),
            resume: false,
            progress: None,
        });

        assert!(result.is_err());
        assert!(!target.exists());
    }

    #[test]
    fn http_downloader_fetches_full_content() {
        let port = free_port();
        let server = Server::http(format!("127.0.0.1:{port}")).unwrap();
        let body = b"hello over http".to_vec();
        let handle = std::thread::spawn({
            let body = body.clone();
            move || {
                let request = server.recv().unwrap();
                request
                    .respond(Response::from_data(body))
                    .unwrap();
            }
        });

        let dl = HttpDownloader::new().unwrap();
        let target_dir = tempdir().unwrap();
        let target = target_dir.path().join("out.bin");
        let expected = packmule_hash::hash_bytes(&body);

        let outcome = dl
            .fetch(&FetchRequest {
                url: &format!("http://127.0.0.1:{port}/file"),
                target_path: &target,
                expected_sha256: Some(&expected),
                resume: false,
                progress: None,
            })
            .unwrap();

        handle.join().unwrap();
        assert_eq!(outcome.bytes_written, body.len() as u64);
        assert!(!outcome.resumed);
        assert_eq!(std::fs::read(&target).unwrap(), body);
    }

    #[test]
    fn http_downloader_resumes_partial_download_on_206() {
        let port = free_port();
        let server = Server::http(format!("127.0.0.1:{port}")).unwrap();
        let full = b"0123456789ABCDEF".to_vec();
        let tail = full[8..].to_vec();

        let handle = std::thread::spawn({
            let tail = tail.clone();
            move || {
                let request = server.recv().unwrap();
                let range_header = request
                    .headers()
                    .iter()
                    .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("Range"));
                assert!(range_header.is_some(), "expected a Range header on resume");
                let content_range =
                    Header::from_bytes(&b"Content-Range"[..], &b"bytes 8-15/16"[..]).unwrap();
                let response = Response::from_data(tail).with_status_code(206).with_header(content_range);
                request.respond(response).unwrap();
            }
        });

        let target_dir = tempdir().unwrap();
        let target = target_dir.path().join("out.bin");
        std::fs::write(&target, &full[..8]).unwrap();

        let dl = HttpDownloader::new().unwrap();
        let expected = packmule_hash::hash_bytes(&full);

        let outcome = dl
            .fetch(&FetchRequest {
                url: &format!("http://127.0.0.1:{port}/file"),
                target_path: &target,
                expected_sha256: Some(&expected),
                resume: true,
                progress: None,
            })
            .unwrap();

        handle.join().unwrap();
        assert!(outcome.resumed);
        assert_eq!(std::fs::read(&target).unwrap(), full);
    }

    #[test]
    fn http_downloader_progress_callback_reports_final_total() {
        let port = free_port();
        let server = Server::http(format!("127.0.0.1:{port}")).unwrap();
        let body = vec![7u8; 4096];
        let handle = std::thread::spawn({
            let body = body.clone();
            move || {
                let request = server.recv().unwrap();
                request.respond(Response::from_data(body)).unwrap();
            }
        });

        let dl = HttpDownloader::new().unwrap();
        let target_dir = tempdir().unwrap();
        let target = target_dir.path().join("out.bin");
        let seen = AtomicU64::new(0);

        let outcome = dl
            .fetch(&FetchRequest {
                url: &format!("http://127.0.0.1:{port}/file"),
                target_path: &target,
                expected_sha256: None,
                resume: false,
                progress: Some(&|p: Progress| {
                    seen.store(p.bytes_downloaded, Ordering::SeqCst);
                }),
            })
            .unwrap();

        handle.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), outcome.bytes_written);
    }
}
