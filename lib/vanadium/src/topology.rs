use crate::error::{DriverError, DriverResult};
use ballast::encoding::base64;
use ballast::logging;
use hashbrown::HashMap;
use rand::seq::SliceRandom;
use serde_derive::Deserialize;
use std::cmp;
use std::io;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Seeds attempted per fetch, capped by the seed list length.
pub const MAX_TRIES: usize = 3;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "vanadium/0.1";

/// Bucket config as served by `/pools/default/buckets/<bucket>`. Unknown
/// fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Absent on the blob served over the data plane (`GetClusterConfig`).
    #[serde(default)]
    pub name: String,
    #[serde(rename = "bucketType", default)]
    pub bucket_type: String,
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_server_map: Option<VBucketServerMap>,
    #[serde(rename = "nodesExt", default)]
    pub nodes_ext: Vec<NodeExt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm", default)]
    pub hash_algorithm: String,
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    /// Entry layout: `[primary_idx, replica_idx, ..]`; `-1` marks an absent
    /// replica.
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExt {
    /// Service name to port, e.g. `kv` or `n1ql`.
    #[serde(default)]
    pub services: HashMap<String, u16>,
    /// Absent (or the `$HOST` placeholder) on single-node clusters; the
    /// contacted host fills in.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Fetches bucket configs from the cluster REST endpoint over plain
/// HTTP/1.0. The seed order is shuffled once at construction.
pub struct TopologyFetcher {
    seeds: Vec<String>,
    auth_token: String,
    log: logging::Logger,
}

impl TopologyFetcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        host_ports: Vec<String>,
        username: &str,
        password: &str,
        log: L,
    ) -> TopologyFetcher {
        let mut seeds = host_ports;
        seeds.shuffle(&mut rand::thread_rng());

        TopologyFetcher {
            seeds,
            auth_token: base64::encode(format!("{}:{}", username, password)),
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Returns the first accepted config across at most `min(3, seeds)`
    /// attempts. Per-seed failures are logged and skipped; zero accepted
    /// configs is a hard error.
    pub fn fetch_config(&self, bucket: &str) -> DriverResult<BucketConfig> {
        let tries = cmp::min(MAX_TRIES, self.seeds.len());

        for seed in &self.seeds[..tries] {
            match self.fetch_from_seed(seed, bucket) {
                Ok(config) => return Ok(config),
                Err(err) => {
                    logging::debug!(self.log, "config fetch from seed failed";
                                    "context" => "fetch_config",
                                    "seed" => seed,
                                    "bucket" => bucket,
                                    "error" => %err);
                }
            }
        }

        Err(DriverError::ConfigFetch(format!(
            "no config for bucket `{}` after {} seed(s)",
            bucket, tries
        )))
    }

    fn fetch_from_seed(&self, seed: &str, bucket: &str) -> DriverResult<BucketConfig> {
        let sock_addr = seed
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| DriverError::Connect {
                message: format!("no resolver result for {}", seed),
                refused: false,
            })?;

        let mut stream =
            TcpStream::connect_timeout(&sock_addr, FETCH_TIMEOUT).map_err(|err| {
                DriverError::Connect {
                    refused: err.kind() == io::ErrorKind::ConnectionRefused,
                    message: format!("{}: {}", seed, err),
                }
            })?;
        stream.set_read_timeout(Some(FETCH_TIMEOUT))?;
        stream.set_write_timeout(Some(FETCH_TIMEOUT))?;

        let path = format!("/pools/default/buckets/{}", bucket);
        let body = http_get(&mut stream, seed, &path, &self.auth_token)?;

        decode_config(&body, seed)
    }
}

/// Accepts only JSON object bodies; the REST endpoint answers misses with
/// plain text such as "Requested resource not found.".
pub(crate) fn decode_config(body: &[u8], seed: &str) -> DriverResult<BucketConfig> {
    if body.first() != Some(&b'{') {
        return Err(DriverError::ConfigFetch(format!(
            "non-JSON body from {}",
            seed
        )));
    }

    serde_json::from_slice(body)
        .map_err(|err| DriverError::ConfigFetch(format!("bad config JSON from {}: {}", seed, err)))
}

/// Sends a minimal HTTP/1.0 GET and returns the response body.
pub(crate) fn http_get<S: Read + Write>(
    stream: &mut S,
    host: &str,
    path: &str,
    auth_token: &str,
) -> DriverResult<Vec<u8>> {
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nAuthorization: Basic {}\r\nUser-Agent: {}\r\nAccept: application/json\r\n\r\n",
        path, host, auth_token, USER_AGENT
    );

    stream.write_all(request.as_bytes())?;
    read_body(stream)
}

/// Sends a minimal HTTP/1.0 form POST and returns the response body.
pub(crate) fn http_post_form<S: Read + Write>(
    stream: &mut S,
    host: &str,
    path: &str,
    auth_token: &str,
    body: &str,
) -> DriverResult<Vec<u8>> {
    let request = format!(
        "POST {} HTTP/1.0\r\nHost: {}\r\nAuthorization: Basic {}\r\nUser-Agent: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        path, host, auth_token, USER_AGENT, body.len(), body
    );

    stream.write_all(request.as_bytes())?;
    read_body(stream)
}

/// Reads headers up to the blank line, then the body: exactly
/// `Content-Length` bytes when the header is present, to end of stream
/// otherwise.
pub(crate) fn read_body<S: Read>(stream: &mut S) -> DriverResult<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_blank_line(&data) {
            break pos;
        }

        let count = stream.read(&mut chunk)?;
        if count == 0 {
            return Err(DriverError::ConfigFetch(
                "response ended before headers".into(),
            ));
        }
        data.extend_from_slice(&chunk[..count]);
    };

    let content_length = parse_content_length(&data[..header_end]);
    let mut body = data.split_off(header_end + 4);

    match content_length {
        Some(length) => {
            while body.len() < length {
                let count = stream.read(&mut chunk)?;
                if count == 0 {
                    return Err(DriverError::ShortRead);
                }
                body.extend_from_slice(&chunk[..count]);
            }

            body.truncate(length);
            Ok(body)
        }
        None => {
            loop {
                let count = stream.read(&mut chunk)?;
                if count == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..count]);
            }

            Ok(body)
        }
    }
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(headers);

    for line in text.lines() {
        let mut parts = line.splitn(2, ':');
        let name = parts.next().unwrap_or("");

        if name.trim().eq_ignore_ascii_case("content-length") {
            if let Some(value) = parts.next() {
                if let Ok(length) = value.trim().parse() {
                    return Some(length);
                }
            }
        }
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::connection::tests::MockStream;

    pub(crate) const SAMPLE_CONFIG: &str = r#"{
        "name": "beer-sample",
        "bucketType": "membase",
        "numReplicas": 1,
        "nodesExt": [
            {"services": {"kv": 11210, "n1ql": 8093}, "hostname": "10.0.0.1"},
            {"services": {"kv": 11210}}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, -1]]
        }
    }"#;

    fn http_response(body: &str, with_length: bool) -> String {
        match with_length {
            true => format!(
                "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            ),
            _ => format!("HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{}", body),
        }
    }

    #[test]
    fn test_read_body_with_content_length() {
        let raw = format!("{}trailing garbage", http_response("hello", true));
        let mut stream = MockStream::new(raw.into_bytes());

        let body = read_body(&mut stream).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_read_body_without_content_length_runs_to_eof() {
        let mut stream = MockStream::new(http_response("streamed body", false).into_bytes());

        let body = read_body(&mut stream).unwrap();
        assert_eq!(body, b"streamed body");
    }

    #[test]
    fn test_read_body_truncated_headers() {
        let mut stream = MockStream::new(b"HTTP/1.0 200 OK\r\nContent-".to_vec());

        match read_body(&mut stream) {
            Err(DriverError::ConfigFetch(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_read_body_short_body() {
        let mut stream =
            MockStream::new(b"HTTP/1.0 200 OK\r\nContent-Length: 50\r\n\r\nshort".to_vec());

        match read_body(&mut stream) {
            Err(DriverError::ShortRead) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_content_length_is_case_insensitive() {
        assert_eq!(
            parse_content_length(b"content-LENGTH: 42\r\nServer: x"),
            Some(42)
        );
        assert_eq!(parse_content_length(b"Server: x"), None);
    }

    #[test]
    fn test_http_get_request_shape() {
        let mut stream = MockStream::new(http_response("{}", true).into_bytes());

        http_get(&mut stream, "10.0.0.1:8091", "/pools/default/buckets/beer", "dG9rZW4=").unwrap();

        let sent = String::from_utf8(stream.outgoing.clone()).unwrap();
        assert!(sent.starts_with("GET /pools/default/buckets/beer HTTP/1.0\r\n"));
        assert!(sent.contains("Host: 10.0.0.1:8091\r\n"));
        assert!(sent.contains("Authorization: Basic dG9rZW4=\r\n"));
        assert!(sent.contains("User-Agent: "));
        assert!(sent.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_http_post_form_request_shape() {
        let mut stream = MockStream::new(http_response("{}", true).into_bytes());

        http_post_form(
            &mut stream,
            "10.0.0.1:8093",
            "/query/service",
            "dG9rZW4=",
            "statement=SELECT+1",
        )
        .unwrap();

        let sent = String::from_utf8(stream.outgoing.clone()).unwrap();
        assert!(sent.starts_with("POST /query/service HTTP/1.0\r\n"));
        assert!(sent.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(sent.contains("Content-Length: 18\r\n"));
        assert!(sent.ends_with("\r\n\r\nstatement=SELECT+1"));
    }

    #[test]
    fn test_decode_config_accepts_json_object() {
        let config = decode_config(SAMPLE_CONFIG.as_bytes(), "seed").unwrap();

        assert_eq!(config.name, "beer-sample");
        assert_eq!(config.bucket_type, "membase");

        let map = config.vbucket_server_map.unwrap();
        assert_eq!(map.hash_algorithm, "CRC");
        assert_eq!(map.server_list.len(), 2);
        assert_eq!(map.vbucket_map.len(), 4);
        assert_eq!(map.vbucket_map[3], vec![1, -1]);

        assert_eq!(config.nodes_ext[0].services.get("n1ql"), Some(&8093));
        assert_eq!(config.nodes_ext[1].hostname, None);
    }

    #[test]
    fn test_decode_config_rejects_text_body() {
        match decode_config(b"Requested resource not found.", "seed") {
            Err(DriverError::ConfigFetch(message)) => assert!(message.contains("non-JSON")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_fetch_config_exhausts_seeds() {
        // Unroutable seeds; every attempt must fail and be skipped.
        let fetcher = TopologyFetcher::new(
            vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()],
            "user",
            "pass",
            None,
        );

        match fetcher.fetch_config("default") {
            Err(DriverError::ConfigFetch(message)) => assert!(message.contains("2 seed(s)")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_auth_token_encoding() {
        let fetcher = TopologyFetcher::new(Vec::new(), "user", "password", None);
        assert_eq!(fetcher.auth_token(), "dXNlcjpwYXNzd29yZA==");

        let empty_pass = TopologyFetcher::new(Vec::new(), "user", "", None);
        assert_eq!(empty_pass.auth_token(), "dXNlcjo=");
    }
}
