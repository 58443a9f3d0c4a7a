use crate::{ArchiveSource, FetchConfig, FetchError, SourceStream};

/// `http://` and `https://` archive source.
///
/// A non-zero offset is requested with `Range: bytes=<offset>-`. A `206` reply
/// resumes the transfer, a `200` restarts it from byte zero and a `416` is retried
/// once without the range header.
pub struct HttpSource {
    config: FetchConfig,
    agent: ureq::Agent,
}

impl HttpSource {
    pub fn new(config: FetchConfig) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self { config, agent }
    }

    fn do_get(&self, url: &str, offset: u64) -> Result<SourceStream, FetchError> {
        let mut req = self.agent.get(url);
        if offset > 0 {
            req = req.header("Range", &format!("bytes={offset}-"));
        }
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(FetchError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(416)) if offset > 0 => {
                tracing::debug!("range {offset}- not satisfiable for {url}, restarting");
                return self.do_get(url, 0);
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(FetchError::Network(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(FetchError::Network(e.to_string()));
            }
        };

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(FetchError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(FetchError::Network(format!("HTTP {code} for {url}")));
        }

        let resumed = offset > 0 && code == 206;
        let content_range_total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let body_len = resp.body().content_length();
        let total_len = if resumed {
            content_range_total.or(body_len.map(|len| offset + len))
        } else {
            body_len
        };

        Ok(SourceStream {
            reader: Box::new(resp.into_body().into_reader()),
            total_len,
            resumed,
        })
    }
}

impl ArchiveSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError> {
        let url = self.config.resolve(reference);
        tracing::debug!("GET {url} from byte {offset}");
        self.do_get(&url, offset)
    }
}

/// Total length from a `Content-Range: bytes a-b/total` value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        path: String,
        headers: HashMap<String, String>,
    }

    struct MockServer {
        addr: String,
        _handle: std::thread::JoinHandle<()>,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl MockServer {
        /// Serves `blobs` by path. Range requests are honoured unless `ranges` is false.
        fn start(blobs: HashMap<String, Vec<u8>>, ranges: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let blobs = Arc::new(blobs);
            let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

            let requests_clone = Arc::clone(&requests);
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let blobs = Arc::clone(&blobs);
                    let reqs = Arc::clone(&requests_clone);

                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        let parts: Vec<&str> = request_line.trim().splitn(3, ' ').collect();
                        if parts.len() < 2 {
                            return;
                        }
                        let path = parts[1].to_owned();

                        let mut headers = HashMap::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                            if let Some((k, v)) = line.trim().split_once(": ") {
                                headers.insert(k.to_lowercase(), v.to_owned());
                            }
                        }
                        let range_start: Option<usize> = headers
                            .get("range")
                            .and_then(|r| r.strip_prefix("bytes="))
                            .and_then(|r| r.strip_suffix('-'))
                            .and_then(|n| n.parse().ok());
                        reqs.lock().unwrap().push(CapturedRequest {
                            path: path.clone(),
                            headers,
                        });

                        let Some(blob) = blobs.get(&path) else {
                            let _ = stream.write_all(
                                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            );
                            return;
                        };
                        let (head, body): (String, &[u8]) = match range_start {
                            Some(start) if ranges && start >= blob.len() => (
                                format!(
                                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                                    blob.len()
                                ),
                                &[],
                            ),
                            Some(start) if ranges => (
                                format!(
                                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                    start,
                                    blob.len() - 1,
                                    blob.len(),
                                    blob.len() - start
                                ),
                                &blob[start..],
                            ),
                            _ => (
                                format!(
                                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                    blob.len()
                                ),
                                blob.as_slice(),
                            ),
                        };
                        let _ = stream.write_all(head.as_bytes());
                        let _ = stream.write_all(body);
                        let _ = stream.flush();
                    });
                }
            });

            MockServer {
                addr,
                _handle: handle,
                requests,
            }
        }

        fn captured_requests(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn blobs() -> HashMap<String, Vec<u8>> {
        let mut map = HashMap::new();
        map.insert("/jre/17.tar".to_owned(), b"0123456789abcdef".to_vec());
        map
    }

    fn read_all(stream: SourceStream) -> Vec<u8> {
        let mut reader = stream.reader;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn full_get_reports_length() {
        let server = MockServer::start(blobs(), true);
        let source = HttpSource::new(FetchConfig::default());
        let stream = source.open(&format!("{}/jre/17.tar", server.addr), 0).unwrap();
        assert!(!stream.resumed);
        assert_eq!(stream.total_len, Some(16));
        assert_eq!(read_all(stream), b"0123456789abcdef");
    }

    #[test]
    fn range_request_resumes() {
        let server = MockServer::start(blobs(), true);
        let source = HttpSource::new(FetchConfig::default());
        let stream = source.open(&format!("{}/jre/17.tar", server.addr), 10).unwrap();
        assert!(stream.resumed);
        assert_eq!(stream.total_len, Some(16));
        assert_eq!(read_all(stream), b"abcdef");

        let reqs = server.captured_requests();
        assert_eq!(reqs[0].headers.get("range").map(String::as_str), Some("bytes=10-"));
    }

    #[test]
    fn server_without_ranges_restarts() {
        let server = MockServer::start(blobs(), false);
        let source = HttpSource::new(FetchConfig::default());
        let stream = source.open(&format!("{}/jre/17.tar", server.addr), 10).unwrap();
        assert!(!stream.resumed);
        assert_eq!(read_all(stream), b"0123456789abcdef");
    }

    #[test]
    fn unsatisfiable_range_retries_from_zero() {
        let server = MockServer::start(blobs(), true);
        let source = HttpSource::new(FetchConfig::default());
        let stream = source.open(&format!("{}/jre/17.tar", server.addr), 99).unwrap();
        assert!(!stream.resumed);
        assert_eq!(read_all(stream), b"0123456789abcdef");
        assert_eq!(server.captured_requests().len(), 2);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let server = MockServer::start(blobs(), true);
        let source = HttpSource::new(FetchConfig::default());
        let result = source.open(&format!("{}/nope.tar", server.addr), 0);
        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }

    #[test]
    fn connection_refused_is_network_error() {
        let source = HttpSource::new(FetchConfig::default());
        let result = source.open("http://127.0.0.1:1/x.tar", 0);
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[test]
    fn mirror_and_token_are_applied() {
        let server = MockServer::start(blobs(), true);
        let config = FetchConfig::with_mirror(&server.addr).with_token("tok-42");
        let source = HttpSource::new(config);
        let stream = source.open("https://origin.invalid/jre/17.tar", 0).unwrap();
        assert_eq!(read_all(stream).len(), 16);

        let reqs = server.captured_requests();
        assert_eq!(reqs[0].path, "/jre/17.tar");
        assert_eq!(
            reqs[0].headers.get("authorization").map(String::as_str),
            Some("Bearer tok-42")
        );
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range_total("bytes 10-15/16"), Some(16));
        assert_eq!(parse_content_range_total("bytes */16"), Some(16));
        assert_eq!(parse_content_range_total("bytes 0-1/*"), None);
    }
}
