//! QSTP/1 request and response frames
//!
//! A frame is the plaintext payload of one secure message:
//!
//! ```text
//! QSTP/1 <METHOD> <PATH>[\n<key>: <value>]*[\n\n<raw body>]
//! QSTP/1 <STATUS-CODE> <REASON>[\n<key>: <value>]*[\n\n<raw body>]
//! ```
//!
//! Everything before the first `\n\n` is the head, everything after it is the
//! body. This module never touches a socket.

use crate::address::Address;
use crate::QstpError;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Protocol identifier carried on every info line
pub const VERSION: &str = "QSTP/1";

/// Body bytes shown by the `Display` impls before truncating
const DISPLAY_BODY_LIMIT: usize = 50;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
    Patch,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Get, Method::Post, Method::Delete, Method::Patch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = QstpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            _ => Err(QstpError::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes with their canonical reason phrases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Client-local: the TCP connect was refused
    ConnectionRefused,
    ServerOk,
    /// A handler failed
    ServerError,
    Ok,
    Malformed,
    UnknownVersion,
    UnknownMethod,
    UnknownPath,
    Unauthenticated,
    Unauthorized,
    /// Reverse proxy success
    ProxyOk,
    /// Missing `Host` header
    Incomplete,
    UnknownHost,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::ConnectionRefused => 1,
            StatusCode::ServerOk => 100,
            StatusCode::ServerError => 101,
            StatusCode::Ok => 200,
            StatusCode::Malformed => 201,
            StatusCode::UnknownVersion => 202,
            StatusCode::UnknownMethod => 203,
            StatusCode::UnknownPath => 204,
            StatusCode::Unauthenticated => 205,
            StatusCode::Unauthorized => 206,
            StatusCode::ProxyOk => 300,
            StatusCode::Incomplete => 301,
            StatusCode::UnknownHost => 302,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::ConnectionRefused => "CONNECTION REFUSED",
            StatusCode::ServerOk => "SERVER OK",
            StatusCode::ServerError => "SERVER ERROR",
            StatusCode::Ok => "OK",
            StatusCode::Malformed => "MALFORMED",
            StatusCode::UnknownVersion => "UNKNOWN VERSION",
            StatusCode::UnknownMethod => "UNKNOWN METHOD",
            StatusCode::UnknownPath => "UNKNOWN PATH",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
            StatusCode::Unauthorized => "UNAUTHORIZED",
            StatusCode::ProxyOk => "OK",
            StatusCode::Incomplete => "INCOMPLETE",
            StatusCode::UnknownHost => "UNKNOWN HOST",
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = QstpError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => StatusCode::ConnectionRefused,
            100 => StatusCode::ServerOk,
            101 => StatusCode::ServerError,
            200 => StatusCode::Ok,
            201 => StatusCode::Malformed,
            202 => StatusCode::UnknownVersion,
            203 => StatusCode::UnknownMethod,
            204 => StatusCode::UnknownPath,
            205 => StatusCode::Unauthenticated,
            206 => StatusCode::Unauthorized,
            300 => StatusCode::ProxyOk,
            301 => StatusCode::Incomplete,
            302 => StatusCode::UnknownHost,
            _ => return Err(QstpError::InvalidStatusCode(code)),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Ordered header map with unique keys.
///
/// Keys are compared exactly, case as supplied. Inserting an existing key
/// replaces its value in place. Keys and values must survive a trip through
/// a frame unchanged: no `\n`, no surrounding whitespace, and no `:` in keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), QstpError> {
        let key = key.into();
        let value = value.into();
        check_header(&key, &value)?;
        self.insert_unchecked(key, value);
        Ok(())
    }

    fn insert_unchecked(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `key: value` lines. Splits at the first `:` and trims both sides.
    fn parse(raw: &str) -> Result<Self, String> {
        let mut headers = Headers::new();
        for line in raw.split('\n') {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| format!("header line without ':': {:?}", line))?;
            headers.insert_unchecked(key.trim().to_string(), value.trim().to_string());
        }
        Ok(headers)
    }

    fn write_to(&self, head: &mut String) {
        for (key, value) in self.iter() {
            head.push('\n');
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
        }
    }
}

fn check_header(key: &str, value: &str) -> Result<(), QstpError> {
    if key.contains(['\n', ':']) || key.trim() != key {
        return Err(QstpError::InvalidHeader(format!("key {:?}", key)));
    }
    if value.contains('\n') || value.trim() != value {
        return Err(QstpError::InvalidHeader(format!("value {:?} of {:?}", value, key)));
    }
    Ok(())
}

fn check_path(path: &str) -> Result<(), QstpError> {
    if !path.starts_with('/') || path.contains('\n') {
        return Err(QstpError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Recoverable request parse failure, answered with its status code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown protocol version {0:?}")]
    UnknownVersion(String),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::Malformed(_) => StatusCode::Malformed,
            ParseError::UnknownVersion(_) => StatusCode::UnknownVersion,
            ParseError::UnknownMethod(_) => StatusCode::UnknownMethod,
        }
    }

    pub fn into_response(self) -> Response {
        Response::new(self.status())
    }
}

/// A QSTP request. `address` is the peer (or, when forwarding, the
/// destination) and is never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub address: Address,
    pub method: Method,
    path: String,
    pub headers: Headers,
    pub data: Bytes,
}

impl Request {
    /// Fails unless `path` starts with `/` and is a single line.
    pub fn new(address: Address, method: Method, path: impl Into<String>) -> Result<Self, QstpError> {
        let path = path.into();
        check_path(&path)?;
        Ok(Self {
            address,
            method,
            path,
            headers: Headers::new(),
            data: Bytes::new(),
        })
    }

    /// Build a request from an untyped method name.
    pub fn from_parts(
        address: Address,
        method: &str,
        path: impl Into<String>,
        headers: Headers,
        data: impl Into<Bytes>,
    ) -> Result<Self, QstpError> {
        let mut request = Self::new(address, method.parse()?, path)?;
        request.headers = headers;
        request.data = data.into();
        Ok(request)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, QstpError> {
        self.headers.insert(key, value)?;
        Ok(self)
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}", VERSION, self.method, self.path);
        self.headers.write_to(&mut head);
        join_body(head, &self.data)
    }

    /// Parse a request frame received from `address`.
    pub fn from_frame(frame: &[u8], address: Address) -> Result<Self, ParseError> {
        let parts = split_frame(frame).map_err(ParseError::Malformed)?;
        let [version, method, path] = parts.info;

        if version != VERSION {
            return Err(ParseError::UnknownVersion(version.to_string()));
        }

        let method = method
            .parse::<Method>()
            .map_err(|_| ParseError::UnknownMethod(method.to_string()))?;
        check_path(path).map_err(|e| ParseError::Malformed(e.to_string()))?;

        Ok(Self {
            address,
            method,
            path: path.to_string(),
            headers: parts.headers,
            data: Bytes::copy_from_slice(parts.body),
        })
    }
}

/// A QSTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub data: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            data: Bytes::new(),
        }
    }

    /// Build a response from a numeric status code.
    pub fn with_code(code: u16) -> Result<Self, QstpError> {
        Ok(Self::new(StatusCode::try_from(code)?))
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, QstpError> {
        self.headers.insert(key, value)?;
        Ok(self)
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} {}",
            VERSION,
            self.status.code(),
            self.status.reason()
        );
        self.headers.write_to(&mut head);
        join_body(head, &self.data)
    }

    /// Parse a response frame. The reason phrase is not checked.
    pub fn from_frame(frame: &[u8]) -> Result<Self, QstpError> {
        let parts = split_frame(frame).map_err(QstpError::InvalidResponse)?;
        let [version, code, _reason] = parts.info;

        if version != VERSION {
            return Err(QstpError::InvalidResponse(format!(
                "unknown protocol version {:?}",
                version
            )));
        }

        let code = code
            .parse::<u16>()
            .map_err(|_| QstpError::InvalidResponse(format!("invalid status code {:?}", code)))?;

        Ok(Self {
            status: StatusCode::try_from(code)?,
            headers: parts.headers,
            data: Bytes::copy_from_slice(parts.body),
        })
    }
}

struct FrameParts<'a> {
    info: [&'a str; 3],
    headers: Headers,
    body: &'a [u8],
}

fn split_frame(frame: &[u8]) -> Result<FrameParts<'_>, String> {
    let (head, body) = match frame.windows(2).position(|w| w == b"\n\n") {
        Some(pos) => (&frame[..pos], &frame[pos + 2..]),
        None => (frame, &[][..]),
    };

    let head = std::str::from_utf8(head).map_err(|e| format!("head is not UTF-8: {}", e))?;
    let (info_line, headers_raw) = head.split_once('\n').unwrap_or((head, ""));

    let mut tokens = info_line.splitn(3, ' ');
    let info = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => return Err(format!("info line needs 3 tokens: {:?}", info_line)),
    };

    let headers = if headers_raw.is_empty() {
        Headers::new()
    } else {
        Headers::parse(headers_raw)?
    };

    Ok(FrameParts {
        info,
        headers,
        body,
    })
}

fn join_body(head: String, data: &[u8]) -> Vec<u8> {
    let mut frame = head.into_bytes();
    if !data.is_empty() {
        frame.extend_from_slice(b"\n\n");
        frame.extend_from_slice(data);
    }
    frame
}

fn fmt_extras(f: &mut fmt::Formatter<'_>, headers: &Headers, data: &[u8]) -> fmt::Result {
    if !headers.is_empty() {
        f.write_str(", headers = {")?;
        for (i, (k, v)) in headers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {:?}", k, v)?;
        }
        f.write_str("}")?;
    }
    if !data.is_empty() {
        let shown = &data[..data.len().min(DISPLAY_BODY_LIMIT)];
        write!(f, ", data = b\"{}\"", shown.escape_ascii())?;
        if data.len() > DISPLAY_BODY_LIMIT {
            f.write_str("...")?;
        }
    }
    Ok(())
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request(address = {}, method = {}, path = {:?}",
            self.address, self.method, self.path
        )?;
        fmt_extras(f, &self.headers, &self.data)?;
        f.write_str(")")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response(status = {}", self.status)?;
        fmt_extras(f, &self.headers, &self.data)?;
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Address {
        Address::new("127.0.0.1", 50000)
    }

    fn parse(frame: &[u8]) -> Result<Request, ParseError> {
        Request::from_frame(frame, peer())
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::new(peer(), Method::Post, "/upload")
            .unwrap()
            .with_header("filename", "test.txt")
            .unwrap()
            .with_header("content-length", "12")
            .unwrap()
            .with_data(&b"file content"[..]);

        let frame = request.to_frame();
        assert_eq!(
            frame,
            b"QSTP/1 POST /upload\nfilename: test.txt\ncontent-length: 12\n\nfile content"
        );
        assert_eq!(parse(&frame).unwrap(), request);
    }

    #[test]
    fn test_request_without_headers_or_body() {
        let request = Request::new(peer(), Method::Get, "/").unwrap();
        assert_eq!(request.to_frame(), b"QSTP/1 GET /");
        assert_eq!(parse(b"QSTP/1 GET /").unwrap(), request);
    }

    #[test]
    fn test_body_without_headers() {
        let request = parse(b"QSTP/1 GET /echo\n\nabc").unwrap();
        assert!(request.headers.is_empty());
        assert_eq!(&request.data[..], b"abc");
    }

    #[test]
    fn test_body_split_at_first_blank_line() {
        let request = parse(b"QSTP/1 POST /x\na: 1\n\nline\n\nmore").unwrap();
        assert_eq!(request.headers.get("a"), Some("1"));
        assert_eq!(&request.data[..], b"line\n\nmore");
    }

    #[test]
    fn test_binary_body_is_preserved() {
        let body: Vec<u8> = (0..=255u8).collect();
        let request = Request::new(peer(), Method::Patch, "/bin").unwrap().with_data(body.clone());
        let parsed = parse(&request.to_frame()).unwrap();
        assert_eq!(&parsed.data[..], &body[..]);
    }

    #[test]
    fn test_path_keeps_spaces() {
        let request = parse(b"QSTP/1 GET /a b c").unwrap();
        assert_eq!(request.path(), "/a b c");
    }

    #[test]
    fn test_parse_failure_matrix() {
        assert_eq!(parse(b"QSTP/1 GET").unwrap_err().status().code(), 201);
        assert_eq!(parse(b"").unwrap_err().status().code(), 201);
        assert_eq!(parse(b"QSTP/2 GET /x").unwrap_err().status().code(), 202);
        assert_eq!(parse(b"QSTP/1 FOO /x").unwrap_err().status().code(), 203);
        assert_eq!(parse(b"QSTP/1 get /x").unwrap_err().status().code(), 203);
        assert_eq!(parse(b"QSTP/1 GET users").unwrap_err().status().code(), 201);
    }

    #[test]
    fn test_header_line_without_colon_is_malformed() {
        let err = parse(b"QSTP/1 GET /x\nno-colon-here").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert_eq!(err.into_response().status, StatusCode::Malformed);
    }

    #[test]
    fn test_non_utf8_head_is_malformed() {
        let err = parse(b"QSTP/1 GET /\xff\xfe").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_header_parsing_trims_and_splits_at_first_colon() {
        let request = parse(b"QSTP/1 GET /\n  Host :  a.com:8080  \nX-Empty:").unwrap();
        assert_eq!(request.headers.get("Host"), Some("a.com:8080"));
        assert_eq!(request.headers.get("X-Empty"), Some(""));
        assert_eq!(request.headers.get("host"), None);
    }

    #[test]
    fn test_duplicate_header_keeps_first_position_last_value() {
        let request = parse(b"QSTP/1 GET /\na: 1\nb: 2\na: 3").unwrap();
        let pairs: Vec<_> = request.headers.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_response_roundtrip() {
        let response = Response::new(StatusCode::UnknownPath)
            .with_header("request-method", "GET")
            .unwrap()
            .with_header("request-path", "/missing")
            .unwrap();
        let frame = response.to_frame();
        assert_eq!(
            frame,
            b"QSTP/1 204 UNKNOWN PATH\nrequest-method: GET\nrequest-path: /missing"
        );
        assert_eq!(Response::from_frame(&frame).unwrap(), response);

        let response = Response::new(StatusCode::Ok).with_data(&b"test data"[..]);
        assert_eq!(Response::from_frame(&response.to_frame()).unwrap(), response);
    }

    #[test]
    fn test_response_parse_errors() {
        assert!(Response::from_frame(b"QSTP/1 200").is_err());
        assert!(Response::from_frame(b"QSTP/9 200 OK").is_err());
        assert!(Response::from_frame(b"QSTP/1 abc OK").is_err());
        assert!(matches!(
            Response::from_frame(b"QSTP/1 404 NOT FOUND"),
            Err(QstpError::InvalidStatusCode(404))
        ));
    }

    #[test]
    fn test_construction_rejects_invalid_values() {
        assert!(matches!(Response::with_code(500), Err(QstpError::InvalidStatusCode(500))));
        assert_eq!(Response::with_code(302).unwrap().status, StatusCode::UnknownHost);

        let err = Request::from_parts(peer(), "PUT", "/", Headers::new(), Bytes::new()).unwrap_err();
        assert!(matches!(err, QstpError::InvalidMethod(m) if m == "PUT"));

        let err = Request::from_parts(peer(), "GET", "x", Headers::new(), Bytes::new()).unwrap_err();
        assert!(matches!(err, QstpError::InvalidPath(p) if p == "x"));
    }

    #[test]
    fn test_values_that_would_change_the_frame_are_rejected() {
        for path in ["/a\nHost: evil.com", "users", ""] {
            let err = Request::new(peer(), Method::Get, path).unwrap_err();
            assert!(matches!(err, QstpError::InvalidPath(_)), "{:?}", path);
        }

        let bad_headers = [
            ("X-Note", "hi\n\nINJECTED"),
            ("X-Note", " v "),
            (" k", "v"),
            ("k ", "v"),
            ("a:b", "v"),
            ("a\nb", "v"),
        ];
        for (key, value) in bad_headers {
            let request = Request::new(peer(), Method::Get, "/").unwrap();
            let err = request.with_header(key, value).unwrap_err();
            assert!(matches!(err, QstpError::InvalidHeader(_)), "{:?}: {:?}", key, value);

            let err = Response::new(StatusCode::Ok).with_header(key, value).unwrap_err();
            assert!(matches!(err, QstpError::InvalidHeader(_)));
        }

        let mut headers = Headers::new();
        assert!(headers.insert("a:b", "v").is_err());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_accepted_edge_values_roundtrip() {
        let request = Request::new(peer(), Method::Patch, "/a b/ c")
            .unwrap()
            .with_header("X-Empty", "")
            .unwrap()
            .with_header("X-Url", "qstp://a.com:8080/x y")
            .unwrap()
            .with_header("", "no key")
            .unwrap()
            .with_data(&b"\n\nbody"[..]);
        assert_eq!(parse(&request.to_frame()).unwrap(), request);

        let response = Response::new(StatusCode::Ok)
            .with_header("request-path", "/a b/ c")
            .unwrap()
            .with_data(&b"\n"[..]);
        assert_eq!(Response::from_frame(&response.to_frame()).unwrap(), response);
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for code in [1, 100, 101, 200, 201, 202, 203, 204, 205, 206, 300, 301, 302] {
            assert_eq!(StatusCode::try_from(code).unwrap().code(), code);
        }
        assert_eq!(StatusCode::ProxyOk.reason(), "OK");
        assert_eq!(StatusCode::ConnectionRefused.to_string(), "1 CONNECTION REFUSED");
    }

    #[test]
    fn test_display_truncates_body() {
        let request = Request::new(peer(), Method::Get, "/")
            .unwrap()
            .with_data(vec![b'a'; 80]);
        let shown = request.to_string();
        assert!(shown.ends_with(&format!("data = b\"{}\"...)", "a".repeat(50))));

        let response = Response::new(StatusCode::Ok);
        assert_eq!(response.to_string(), "Response(status = 200 OK)");
    }
}
