// ============================================
// veeam-server - media.rs
// ============================================
// Gets the installer ISO into the local cache, and removes it again
// afterwards.
//
// The ISO always lands at the same place:
//
//   <cache>/package/<package_name>_<version>.iso
//
// so a second run finds the first run's copy and skips the download when
// the cached file is still the same file (checksum when one is configured,
// otherwise size).
//
// Supported sources:
//   - http:// and https:// URLs (optional basic auth from the data bag)
//   - file:// URLs (file://server/share/... is a UNC path)
//   - plain local or UNC paths (\\server\share\vbr.iso)
//
// Downloads go to a uniquely named .partial file first and are renamed
// into place only once complete, so a failed transfer never leaves a
// half-written ISO where the next run would find it.
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::request::InstallRequest;
use crate::secrets::Credentials;

// ============================================
// ERRORS
// ============================================

/// Why the installer media could not be acquired.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Failed to prepare media cache directory {path}")]
    CacheDir { path: PathBuf, source: io::Error },

    #[error("Failed to download installer media from {uri}")]
    Network { uri: String, source: reqwest::Error },

    #[error("Download of installer media from {uri} timed out")]
    Timeout { uri: String },

    #[error("Download of installer media from {uri} failed with HTTP status {status}")]
    HttpStatus { uri: String, status: u16 },

    #[error("Failed to copy installer media from {uri}")]
    Copy { uri: String, source: io::Error },

    #[error("Failed to write installer media to {path}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Checksum mismatch for installer media {path}: expected {expected}, got {actual}")]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },
}

impl AcquisitionError {
    /// Whether re-running convergence later might succeed. Nothing is
    /// retried here; this is for the caller.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AcquisitionError::ChecksumMismatch { .. })
    }
}

/// Why the cached media could not be removed.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Failed to delete installer media {path}")]
    Delete { path: PathBuf, source: io::Error },
}

// ============================================
// MEDIA ARTIFACT
// ============================================

/// The installer ISO for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaArtifact {
    /// Where it came from
    pub source_uri: String,
    /// Where it lives in the cache
    pub local_path: PathBuf,
    /// Set by the mounter while the image is attached
    pub mounted: bool,
    /// False when an identical cached copy was reused
    pub downloaded: bool,
}

/// Where installer media is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MediaSource {
    Http(String),
    Local(PathBuf),
}

impl MediaSource {
    fn parse(uri: &str) -> Self {
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return MediaSource::Http(uri.to_string());
        }
        if lower.starts_with("file://") {
            let path = file_url_path(uri).unwrap_or_else(|| PathBuf::from(&uri["file://".len()..]));
            return MediaSource::Local(path);
        }
        MediaSource::Local(PathBuf::from(uri))
    }
}

/// Turn a file:// URL into a path.
///
///   file:///C:/isos/vbr.iso        -> C:/isos/vbr.iso
///   file://server/share/vbr.iso    -> \\server\share\vbr.iso
///   file:///srv/my%20isos/vbr.iso  -> /srv/my isos/vbr.iso
fn file_url_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    let path = percent_decode_str(url.path()).decode_utf8().ok()?.into_owned();

    match url.host_str() {
        Some(host) if !host.is_empty() && !host.eq_ignore_ascii_case("localhost") => {
            Some(PathBuf::from(format!(r"\\{}{}", host, path.replace('/', "\\"))))
        }
        _ => {
            let bytes = path.as_bytes();
            if bytes.len() > 3 && bytes[0] == b'/' && bytes[2] == b':' {
                return Some(PathBuf::from(&path[1..]));
            }
            Some(PathBuf::from(path))
        }
    }
}

// ============================================
// ACQUIRE
// ============================================

/// Make sure the installer ISO is in the cache and return it.
///
/// Skips the transfer when the cached copy is still current. Nothing is
/// retried; network and timeout errors go straight back to the caller.
pub fn acquire(request: &InstallRequest) -> Result<MediaArtifact, AcquisitionError> {
    let package_dir = request.package_dir();
    fs::create_dir_all(&package_dir)
        .map_err(|source| AcquisitionError::CacheDir { path: package_dir.clone(), source })?;

    let dest = request.media_path();
    let source = MediaSource::parse(&request.package_source);
    let artifact = |downloaded| MediaArtifact {
        source_uri: request.package_source.clone(),
        local_path: dest.clone(),
        mounted: false,
        downloaded,
    };

    if dest.exists() && cached_copy_is_current(&dest, &source, request) {
        info!(path = %dest.display(), "installer media already cached, skipping download");
        return Ok(artifact(false));
    }

    let partial = package_dir.join(format!(
        ".{}.{}.partial",
        request.iso_file_name,
        uuid::Uuid::new_v4()
    ));

    info!(source = %request.package_source, dest = %dest.display(), "acquiring installer media");
    let fetched = match &source {
        MediaSource::Http(url) => download_http(url, &partial, request),
        MediaSource::Local(path) => copy_local(path, &partial, &request.package_source),
    };
    if let Err(e) = fetched {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    if let Some(expected) = &request.package_checksum {
        let actual = match sha256_file(&partial) {
            Ok(actual) => actual,
            Err(source) => {
                let _ = fs::remove_file(&partial);
                return Err(AcquisitionError::Write { path: partial, source });
            }
        };
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            let _ = fs::remove_file(&partial);
            return Err(AcquisitionError::ChecksumMismatch {
                path: dest.clone(),
                expected: expected.trim().to_ascii_lowercase(),
                actual,
            });
        }
        debug!("installer media checksum verified");
    }

    if let Err(source) = fs::rename(&partial, &dest) {
        let _ = fs::remove_file(&partial);
        return Err(AcquisitionError::Write { path: dest.clone(), source });
    }

    let size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
    info!(path = %dest.display(), bytes = size, "installer media acquired");
    Ok(artifact(true))
}

/// Is the file already at `dest` the same one we'd fetch?
fn cached_copy_is_current(dest: &Path, source: &MediaSource, request: &InstallRequest) -> bool {
    let cached_len = match fs::metadata(dest) {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };

    // A configured checksum is the strongest identity we have
    if let Some(expected) = &request.package_checksum {
        return match sha256_file(dest) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => true,
            Ok(_) => {
                warn!(path = %dest.display(), "cached media checksum differs, fetching again");
                false
            }
            Err(e) => {
                warn!(path = %dest.display(), error = %e, "could not hash cached media");
                false
            }
        };
    }

    match source {
        MediaSource::Local(path) => match fs::metadata(path) {
            Ok(meta) => meta.len() == cached_len,
            Err(_) => false,
        },
        MediaSource::Http(url) => match remote_length(url, request) {
            Some(len) => len == cached_len,
            None => {
                debug!("source size unknown, reusing non-empty cached media");
                cached_len > 0
            }
        },
    }
}

// ============================================
// TRANSFERS
// ============================================

fn http_client(request: &InstallRequest) -> Result<reqwest::blocking::Client, reqwest::Error> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("veeam-server/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(request.download_timeout)
        .build()
}

fn with_auth(
    builder: reqwest::blocking::RequestBuilder,
    credentials: Option<&Credentials>,
) -> reqwest::blocking::RequestBuilder {
    match credentials {
        Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
        None => builder,
    }
}

/// Content-Length header value. `Response::content_length` is the body
/// size, which is always 0 for a HEAD response.
fn header_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Content-Length reported by a HEAD request, if any.
fn remote_length(url: &str, request: &InstallRequest) -> Option<u64> {
    let client = http_client(request).ok()?;
    let response = with_auth(client.head(url), request.download_credentials.as_ref())
        .send()
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    header_length(response.headers())
}

fn download_http(url: &str, partial: &Path, request: &InstallRequest) -> Result<(), AcquisitionError> {
    let network = |source: reqwest::Error| {
        if source.is_timeout() {
            AcquisitionError::Timeout { uri: url.to_string() }
        } else {
            AcquisitionError::Network { uri: url.to_string(), source }
        }
    };

    let client = http_client(request).map_err(network)?;
    if request.download_credentials.is_some() {
        debug!("using download credentials from data bag");
    }
    let mut response = with_auth(client.get(url), request.download_credentials.as_ref())
        .send()
        .map_err(network)?;

    if !response.status().is_success() {
        return Err(AcquisitionError::HttpStatus {
            uri: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_size = header_length(response.headers())
        .or_else(|| response.content_length())
        .unwrap_or(0);
    let write_err = |source| AcquisitionError::Write { path: partial.to_path_buf(), source };
    let mut file = File::create(partial).map_err(write_err)?;
    let mut buffer = [0u8; 64 * 1024];
    let mut downloaded: u64 = 0;
    let mut last_logged = 0;

    loop {
        let bytes_read = match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(AcquisitionError::Timeout { uri: url.to_string() });
            }
            Err(source) => return Err(AcquisitionError::Copy { uri: url.to_string(), source }),
        };
        file.write_all(&buffer[..bytes_read]).map_err(write_err)?;
        downloaded += bytes_read as u64;

        if total_size > 0 {
            let percent = (downloaded * 100) / total_size;
            if percent >= last_logged + 10 {
                last_logged = percent - percent % 10;
                debug!(percent, "download progress");
            }
        }
    }

    file.flush().map_err(write_err)?;
    drop(file);

    if total_size > 0 && downloaded != total_size {
        return Err(AcquisitionError::Copy {
            uri: url.to_string(),
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("received {} of {} bytes", downloaded, total_size),
            ),
        });
    }
    Ok(())
}

fn copy_local(path: &Path, partial: &Path, uri: &str) -> Result<(), AcquisitionError> {
    fs::copy(path, partial)
        .map(|_| ())
        .map_err(|source| AcquisitionError::Copy { uri: uri.to_string(), source })
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================
// CLEANUP
// ============================================

/// Delete the cached ISO unless the request says to keep it.
/// Already gone counts as done.
pub fn cleanup(artifact: &MediaArtifact, request: &InstallRequest) -> Result<(), CleanupError> {
    if request.keep_media {
        info!(path = %artifact.local_path.display(), "keep_media set, leaving installer media in cache");
        return Ok(());
    }

    match fs::remove_file(&artifact.local_path) {
        Ok(()) => {
            info!(path = %artifact.local_path.display(), "deleted installer media");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %artifact.local_path.display(), "installer media already gone");
            Ok(())
        }
        Err(source) => Err(CleanupError::Delete { path: artifact.local_path.clone(), source }),
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fakes::FakeHost;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Request with a local ISO source and a cache in a temp dir.
    fn setup(iso_bytes: &[u8]) -> (tempfile::TempDir, Settings, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share").join("vbr.iso");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, iso_bytes).unwrap();

        let mut settings = Settings::default();
        settings.server.accept_eula = true;
        settings.installer.package_url = Some(source.to_string_lossy().into_owned());
        settings.cache.path = Some(dir.path().join("cache"));
        (dir, settings, source)
    }

    fn request(settings: &Settings) -> InstallRequest {
        InstallRequest::gather(settings, &FakeHost::supported().context())
    }

    fn leftover_partials(request: &InstallRequest) -> usize {
        fs::read_dir(request.package_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!(
            MediaSource::parse("https://example.com/vbr.iso"),
            MediaSource::Http("https://example.com/vbr.iso".into())
        );
        assert_eq!(
            MediaSource::parse("file:///C:/isos/vbr.iso"),
            MediaSource::Local(PathBuf::from("C:/isos/vbr.iso"))
        );
        assert_eq!(
            MediaSource::parse("file:///tmp/vbr.iso"),
            MediaSource::Local(PathBuf::from("/tmp/vbr.iso"))
        );
        assert_eq!(
            MediaSource::parse(r"\\server\share\vbr.iso"),
            MediaSource::Local(PathBuf::from(r"\\server\share\vbr.iso"))
        );
        assert_eq!(
            MediaSource::parse("file://server/share/vbr.iso"),
            MediaSource::Local(PathBuf::from(r"\\server\share\vbr.iso"))
        );
        assert_eq!(
            MediaSource::parse("file://localhost/C:/isos/vbr.iso"),
            MediaSource::Local(PathBuf::from("C:/isos/vbr.iso"))
        );
        assert_eq!(
            MediaSource::parse("file:///srv/my%20isos/Veeam%26Co.iso"),
            MediaSource::Local(PathBuf::from("/srv/my isos/Veeam&Co.iso"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_acquire_from_escaped_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("my isos").join("vbr.iso");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"ISO-CONTENT").unwrap();

        let mut settings = Settings::default();
        settings.installer.package_url =
            Some(format!("file://{}", source.display()).replace(' ', "%20"));
        settings.cache.path = Some(dir.path().join("cache"));
        let request = request(&settings);

        let artifact = acquire(&request).unwrap();
        assert_eq!(fs::read(&artifact.local_path).unwrap(), b"ISO-CONTENT");
    }

    #[test]
    fn test_acquire_copies_to_deterministic_path() {
        let (_dir, settings, _source) = setup(b"ISO-CONTENT");
        let request = request(&settings);

        let artifact = acquire(&request).unwrap();
        assert!(artifact.downloaded);
        assert!(!artifact.mounted);
        assert_eq!(artifact.local_path, request.media_path());
        assert!(artifact
            .local_path
            .ends_with("package/VeeamBackup&Replication_9.0.0.902.iso"));
        assert_eq!(fs::read(&artifact.local_path).unwrap(), b"ISO-CONTENT");
        assert_eq!(leftover_partials(&request), 0);
    }

    #[test]
    fn test_second_acquire_skips_transfer() {
        let (_dir, settings, _source) = setup(b"ISO-CONTENT");
        let request = request(&settings);

        assert!(acquire(&request).unwrap().downloaded);
        let again = acquire(&request).unwrap();
        assert!(!again.downloaded);
        assert_eq!(again.local_path, request.media_path());
    }

    #[test]
    fn test_size_change_fetches_again() {
        let (_dir, settings, source) = setup(b"OLD");
        let request = request(&settings);
        acquire(&request).unwrap();

        fs::write(&source, b"NEWER-AND-LONGER").unwrap();
        let artifact = acquire(&request).unwrap();
        assert!(artifact.downloaded);
        assert_eq!(fs::read(&artifact.local_path).unwrap(), b"NEWER-AND-LONGER");
    }

    #[test]
    fn test_checksum_verified() {
        let (_dir, mut settings, source) = setup(b"ISO-CONTENT");
        settings.installer.package_checksum = Some(sha256_file(&source).unwrap().to_uppercase());
        let request = request(&settings);

        assert!(acquire(&request).unwrap().downloaded);
        assert!(!acquire(&request).unwrap().downloaded);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal_and_leaves_nothing() {
        let (_dir, mut settings, _source) = setup(b"ISO-CONTENT");
        settings.installer.package_checksum = Some("00".repeat(32));
        let request = request(&settings);

        let err = acquire(&request).unwrap_err();
        assert!(matches!(err, AcquisitionError::ChecksumMismatch { .. }));
        assert!(!err.is_retryable());
        assert!(!request.media_path().exists());
        assert_eq!(leftover_partials(&request), 0);
    }

    #[test]
    fn test_missing_source_is_reported() {
        let (_dir, settings, source) = setup(b"ISO-CONTENT");
        fs::remove_file(&source).unwrap();
        let request = request(&settings);

        let err = acquire(&request).unwrap_err();
        assert!(matches!(err, AcquisitionError::Copy { .. }));
        assert!(err.is_retryable());
        assert!(!request.media_path().exists());
        assert_eq!(leftover_partials(&request), 0);
    }

    #[test]
    fn test_cleanup_deletes_media() {
        let (_dir, settings, _source) = setup(b"ISO-CONTENT");
        let request = request(&settings);
        let artifact = acquire(&request).unwrap();

        cleanup(&artifact, &request).unwrap();
        assert!(!artifact.local_path.exists());
        // Second time: already gone is fine
        cleanup(&artifact, &request).unwrap();
    }

    #[test]
    fn test_cleanup_keeps_media_when_asked() {
        let (_dir, mut settings, _source) = setup(b"ISO-CONTENT");
        settings.server.keep_media = true;
        let request = request(&settings);
        let artifact = acquire(&request).unwrap();

        cleanup(&artifact, &request).unwrap();
        assert!(artifact.local_path.exists());
    }

    // ---- HTTP sources, served from a loopback listener ----

    /// Tiny HTTP/1.1 server. `respond` gets the request head and returns
    /// the raw response; every connection is closed after one exchange.
    struct TestServer {
        url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        fn start(respond: impl Fn(&str) -> Vec<u8> + Send + 'static) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}/vbr.iso", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let head = read_head(&mut stream);
                    seen.lock().unwrap().push(head.clone());
                    let _ = stream.write_all(&respond(&head));
                    let _ = stream.flush();
                }
            });
            TestServer { url, requests }
        }

        fn count(&self, method: &str) -> usize {
            let prefix = format!("{} ", method);
            self.requests.lock().unwrap().iter().filter(|r| r.starts_with(&prefix)).count()
        }
    }

    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    /// 200 with `body`; HEAD gets the same headers and no body.
    fn ok_response(head: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        if !head.starts_with("HEAD ") {
            response.extend_from_slice(body);
        }
        response
    }

    fn status_response(code: u16, reason: &str) -> Vec<u8> {
        format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", code, reason).into_bytes()
    }

    fn http_settings(url: &str) -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.server.accept_eula = true;
        settings.installer.package_url = Some(url.to_string());
        settings.installer.download_timeout_secs = 10;
        settings.cache.path = Some(dir.path().join("cache"));
        (dir, settings)
    }

    #[test]
    fn test_header_length() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(header_length(&headers), None);
        headers.insert(reqwest::header::CONTENT_LENGTH, "11".parse().unwrap());
        assert_eq!(header_length(&headers), Some(11));
        headers.insert(reqwest::header::CONTENT_LENGTH, "lots".parse().unwrap());
        assert_eq!(header_length(&headers), None);
    }

    #[test]
    fn test_http_download_then_reuse_via_head() {
        let server = TestServer::start(|head| ok_response(head, b"ISO-CONTENT"));
        let (_dir, settings) = http_settings(&server.url);
        let request = request(&settings);

        let first = acquire(&request).unwrap();
        assert!(first.downloaded);
        assert_eq!(fs::read(&first.local_path).unwrap(), b"ISO-CONTENT");
        assert_eq!(leftover_partials(&request), 0);

        let second = acquire(&request).unwrap();
        assert!(!second.downloaded);
        assert_eq!(server.count("GET"), 1);
        assert_eq!(server.count("HEAD"), 1);
    }

    #[test]
    fn test_http_size_change_downloads_again() {
        let server = TestServer::start(|head| ok_response(head, b"NEWER-AND-LONGER"));
        let (_dir, settings) = http_settings(&server.url);
        let request = request(&settings);
        fs::create_dir_all(request.package_dir()).unwrap();
        fs::write(request.media_path(), b"OLD").unwrap();

        let artifact = acquire(&request).unwrap();
        assert!(artifact.downloaded);
        assert_eq!(fs::read(&artifact.local_path).unwrap(), b"NEWER-AND-LONGER");
        assert_eq!(server.count("GET"), 1);
    }

    #[test]
    fn test_http_sends_data_bag_credentials() {
        // "user:pw"
        let expected = "authorization: basic dxnlcjpwdw==";
        let server = TestServer::start(move |head| {
            if head.to_ascii_lowercase().contains(expected) {
                ok_response(head, b"ISO-CONTENT")
            } else {
                status_response(401, "Unauthorized")
            }
        });
        let (_dir, settings) = http_settings(&server.url);

        let anonymous = request(&settings);
        let err = acquire(&anonymous).unwrap_err();
        assert!(matches!(err, AcquisitionError::HttpStatus { status: 401, .. }));

        let host = FakeHost::supported().with_download_credentials("user", "pw");
        let authorised = InstallRequest::gather(&settings, &host.context());
        let artifact = acquire(&authorised).unwrap();
        assert!(artifact.downloaded);
        assert_eq!(fs::read(&artifact.local_path).unwrap(), b"ISO-CONTENT");
    }

    #[test]
    fn test_http_error_status_leaves_nothing() {
        let server = TestServer::start(|_| status_response(404, "Not Found"));
        let (_dir, settings) = http_settings(&server.url);
        let request = request(&settings);

        let err = acquire(&request).unwrap_err();
        assert!(matches!(err, AcquisitionError::HttpStatus { status: 404, .. }));
        assert!(err.is_retryable());
        assert!(!request.media_path().exists());
        assert_eq!(leftover_partials(&request), 0);
    }

    #[test]
    fn test_http_short_body_is_an_error() {
        let server = TestServer::start(|_| {
            let mut response =
                b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n".to_vec();
            response.extend_from_slice(b"ISO-CONT");
            response
        });
        let (_dir, settings) = http_settings(&server.url);
        let request = request(&settings);

        let err = acquire(&request).unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Copy { .. } | AcquisitionError::Network { .. }
        ));
        assert!(!request.media_path().exists());
        assert_eq!(leftover_partials(&request), 0);
    }
}
