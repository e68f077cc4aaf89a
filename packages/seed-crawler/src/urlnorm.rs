//! URL normalization for deduplication.
//!
//! Normalization runs before hashing and before any cross-page comparison:
//! lowercase scheme and host, strip default ports and fragments, drop
//! tracking parameters, stable-sort the remaining query, preserve path case.

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters stripped during normalization. `utm_` is matched as a
/// prefix; the rest are exact names.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "msclkid", "mc_cid", "mc_eid", "igshid", "ref", "ref_src",
];

fn is_tracking_param(name: &str, extra: &[String]) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.starts_with("utm_")
        || DEFAULT_TRACKING_PARAMS.contains(&lowered.as_str())
        || extra.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Normalize a URL string. Idempotent: normalizing twice yields the same
/// string as normalizing once.
pub fn normalize_url(raw: &str, extra_tracking_params: &[String]) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;

    // The url crate already lowercases scheme and host and drops default
    // ports at parse time; fragments and tracking params are on us.
    url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name, extra_tracking_params))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    if params.is_empty() {
        url.set_query(None);
    } else {
        params.sort();
        let query = params
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    urlencode(name)
                } else {
                    format!("{}={}", urlencode(name), urlencode(value))
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

fn urlencode(part: &str) -> String {
    url::form_urlencoded::byte_serialize(part.as_bytes()).collect()
}

/// SHA-256 of the normalized URL, hex-encoded.
pub fn url_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolve a possibly-relative href against the page's final URL.
pub fn resolve_href(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        normalize_url(raw, &[]).unwrap()
    }

    #[test]
    fn scheme_and_host_are_lowercased() {
        assert_eq!(
            norm("HTTPS://Example.TEST/Path"),
            "https://example.test/Path"
        );
    }

    #[test]
    fn path_case_is_preserved() {
        assert_eq!(norm("https://example.test/CaseSensitive"), "https://example.test/CaseSensitive");
    }

    #[test]
    fn default_ports_are_removed() {
        assert_eq!(norm("http://example.test:80/a"), "http://example.test/a");
        assert_eq!(norm("https://example.test:443/a"), "https://example.test/a");
        assert_eq!(
            norm("https://example.test:8443/a"),
            "https://example.test:8443/a"
        );
    }

    #[test]
    fn fragments_are_dropped() {
        assert_eq!(norm("https://example.test/a#section"), "https://example.test/a");
    }

    #[test]
    fn tracking_params_are_dropped() {
        assert_eq!(
            norm("https://example.test/?q=alpha&utm_source=x&fbclid=123"),
            "https://example.test/?q=alpha"
        );
    }

    #[test]
    fn query_params_are_stable_sorted() {
        assert_eq!(
            norm("https://example.test/?b=2&a=1"),
            norm("https://example.test/?a=1&b=2")
        );
    }

    #[test]
    fn extra_tracking_params_from_config_are_dropped() {
        let extra = vec!["sess".to_string()];
        assert_eq!(
            normalize_url("https://example.test/?q=1&sess=abc", &extra).unwrap(),
            "https://example.test/?q=1"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let urls = [
            "HTTPS://Example.TEST:443/Path?b=2&a=1&utm_medium=email#frag",
            "http://example.test/",
            "https://example.test/a?x=%20space",
        ];
        for raw in urls {
            let once = norm(raw);
            assert_eq!(once, norm(&once), "not idempotent for {raw}");
        }
    }

    #[test]
    fn same_normalized_url_hashes_identically() {
        let a = norm("https://example.test/?a=1&b=2&utm_source=x");
        let b = norm("https://example.test/?b=2&a=1");
        assert_eq!(url_hash(&a), url_hash(&b));
        assert_eq!(url_hash(&a).len(), 64);
    }

    #[test]
    fn relative_hrefs_resolve_against_final_url() {
        assert_eq!(
            resolve_href("https://example.test/list/page2", "../item/42").unwrap(),
            "https://example.test/item/42"
        );
        assert_eq!(
            resolve_href("https://example.test/list", "https://other.test/x").unwrap(),
            "https://other.test/x"
        );
    }
}
