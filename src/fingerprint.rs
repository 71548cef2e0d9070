use crate::flow::FlowRecord;

/// Endpoint identity of a captured request: the lowercase MD5 hex digest of
/// `method + scheme + host + port + normalized_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the endpoint fingerprint and the distinguishing keys of a flow.
///
/// # Normalization
///
/// - The path is cut at the first `?`. If the remaining base contains `/`, every `/` is removed;
///   a base without any `/` normalizes to the empty string.
/// - The fingerprint hashes `method`, `scheme`, `host`, `port` and the normalized path
///   concatenated without separators. Query parameters never contribute, so every request to the
///   same endpoint shares one fingerprint.
/// - The keys are the raw query: everything after the first `?`, kept verbatim (including any
///   further `?`), or the empty string.
///
/// Field boundaries are not delimited, so e.g. host `ab` on port 180 and host `ab1` on port 80
/// hash identically. Stored fingerprints depend on this exact encoding.
pub fn fingerprint_and_keys(record: &FlowRecord) -> (Fingerprint, String) {
    let request = &record.request;
    let (path_base, keys) = match request.path.split_once('?') {
        Some((base, query)) => (base, query.to_owned()),
        None => (request.path.as_str(), String::new()),
    };

    let normalized_path = if path_base.contains('/') {
        path_base.replace('/', "")
    } else {
        String::new()
    };

    let data = format!(
        "{}{}{}{}{}",
        request.method, request.scheme, request.host, request.port, normalized_path
    );
    let digest = md5::compute(data.as_bytes());

    (Fingerprint(format!("{digest:x}")), keys)
}

/// How the keys of a new observation compare to the keys already stored for its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGrowth {
    Richer,
    Unchanged,
    Poorer,
}

impl KeyGrowth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Richer => "richer",
            Self::Unchanged => "unchanged",
            Self::Poorer => "poorer",
        }
    }
}

/// Compares the number of query parameters carried by `observed` against `stored`.
pub fn compare_keys(stored: &str, observed: &str) -> KeyGrowth {
    match query_param_count(observed).cmp(&query_param_count(stored)) {
        std::cmp::Ordering::Greater => KeyGrowth::Richer,
        std::cmp::Ordering::Equal => KeyGrowth::Unchanged,
        std::cmp::Ordering::Less => KeyGrowth::Poorer,
    }
}

fn query_param_count(keys: &str) -> usize {
    keys.split('&').filter(|segment| !segment.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::{KeyGrowth, compare_keys, fingerprint_and_keys};
    use crate::flow::{FlowRecord, FlowRequest, FlowResponse};

    fn record(method: &str, scheme: &str, host: &str, port: u16, path: &str) -> FlowRecord {
        FlowRecord {
            request: FlowRequest {
                method: method.to_owned(),
                scheme: scheme.to_owned(),
                host: host.to_owned(),
                port,
                path: path.to_owned(),
                headers: Vec::new(),
                content: Vec::new(),
                timestamp_start: 0.0,
            },
            response: FlowResponse {
                status_code: 200,
                reason: "OK".to_owned(),
                headers: Vec::new(),
                content: Vec::new(),
            },
        }
    }

    #[test]
    fn strips_slashes_and_query_before_hashing() {
        let (fingerprint, keys) =
            fingerprint_and_keys(&record("GET", "http", "x.com", 80, "/a/b/c?foo=1"));

        // md5("GEThttpx.com80abc")
        assert_eq!(fingerprint.as_str(), "729a6ec20a277a81db923fcc36947bed");
        assert_eq!(keys, "foo=1");
    }

    #[test]
    fn fingerprint_is_a_32_char_lowercase_hex_digest() {
        let (fingerprint, _) = fingerprint_and_keys(&record(
            "POST",
            "https",
            "api.example.com",
            443,
            "/v1/users",
        ));
        // md5("POSThttpsapi.example.com443v1users")
        assert_eq!(fingerprint.to_string(), "61f293fa113f411b26024d8c0f275dbd");
        assert_eq!(fingerprint.as_str().len(), 32);
    }

    #[test]
    fn query_and_separators_do_not_change_the_fingerprint() {
        let paths = ["/a/b", "/a/b?x=1", "/a/b/?y=2&z=3", "//a//b", "/ab", "/ab?"];
        let fingerprints: Vec<_> = paths
            .iter()
            .map(|path| fingerprint_and_keys(&record("GET", "http", "x.com", 80, path)).0)
            .collect();

        for (path, fingerprint) in paths.iter().zip(&fingerprints) {
            assert_eq!(fingerprint, &fingerprints[0], "path `{path}` should collide");
        }
    }

    #[test]
    fn each_identity_dimension_changes_the_fingerprint() {
        let base = fingerprint_and_keys(&record("GET", "http", "x.com", 80, "/a")).0;
        let variants = [
            record("POST", "http", "x.com", 80, "/a"),
            record("GET", "https", "x.com", 80, "/a"),
            record("GET", "http", "y.com", 80, "/a"),
            record("GET", "http", "x.com", 8080, "/a"),
            record("GET", "http", "x.com", 80, "/b"),
        ];

        for variant in &variants {
            assert_ne!(fingerprint_and_keys(variant).0, base, "variant: {variant:?}");
        }
    }

    #[test]
    fn path_without_slash_normalizes_to_empty() {
        let bare = fingerprint_and_keys(&record("GET", "http", "x.com", 80, "")).0;
        let star = fingerprint_and_keys(&record("GET", "http", "x.com", 80, "*")).0;
        let query_only = fingerprint_and_keys(&record("GET", "http", "x.com", 80, "?a=1")).0;

        // md5("GEThttpx.com80")
        assert_eq!(bare.as_str(), "6dd3b4704aac3d5496bb8fe4dd7ae2e6");
        assert_eq!(star, bare);
        assert_eq!(query_only, bare);
    }

    #[test]
    fn ambiguous_field_boundaries_collide() {
        let short_host = fingerprint_and_keys(&record("GET", "http", "ab", 180, "/")).0;
        let long_host = fingerprint_and_keys(&record("GET", "http", "ab1", 80, "/")).0;

        // both hash md5("GEThttpab180")
        assert_eq!(short_host.as_str(), "2cca0dd1d0a575ee426eb2282893c35b");
        assert_eq!(short_host, long_host);
    }

    #[test]
    fn keys_keep_everything_after_the_first_question_mark() {
        let cases = [
            ("/a/b", ""),
            ("/a/b?", ""),
            ("/a/b?x=1&y=2", "x=1&y=2"),
            ("/a?x=1?y=2", "x=1?y=2"),
            ("/a??x", "?x"),
            ("?q=%20", "q=%20"),
        ];
        for (path, expected) in cases {
            let (_, keys) = fingerprint_and_keys(&record("GET", "http", "x.com", 80, path));
            assert_eq!(keys, expected, "path `{path}`");
        }
    }

    #[test]
    fn fingerprinting_is_deterministic() {
        let flow = record("DELETE", "https", "x.com", 443, "/items/9?force=true");
        assert_eq!(fingerprint_and_keys(&flow), fingerprint_and_keys(&flow.clone()));
    }

    #[test]
    fn key_growth_counts_query_parameters() {
        assert_eq!(compare_keys("", "a=1"), KeyGrowth::Richer);
        assert_eq!(compare_keys("a=1", "a=1&b=2"), KeyGrowth::Richer);
        assert_eq!(compare_keys("a=1", "b=22222"), KeyGrowth::Unchanged);
        assert_eq!(compare_keys("a=1&b=2", "a=1"), KeyGrowth::Poorer);
        assert_eq!(compare_keys("a=1&&", "a=1"), KeyGrowth::Unchanged);
        assert_eq!(KeyGrowth::Poorer.as_str(), "poorer");
    }
}
