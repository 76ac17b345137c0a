use crate::kvstore::KVFileStore;
use crate::prelude::*;

use super::html::parse_html;
use super::project_info::ProjectInfo;
use crate::package_db::http::{CacheMode, Http};

use std::time::{Duration, SystemTime};

/// Per-package version-list cache tier (§4.4): even when the HTTP-layer cache
/// (inside `Http`) serves a request without hitting the network, we'd still
/// have to re-parse the index page every time. This caches the *parsed*
/// result, keyed by URL, behind a TTL that's bounded regardless of what
/// `Cache-Control` the index sent -- package indexes gain new releases
/// without always bumping a validator.
const VERSION_LIST_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    fetched_at_unix: u64,
    project_info: ProjectInfo,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_fresh_cache(cache: &KVFileStore, key: &[u8]) -> Option<ProjectInfo> {
    let reader = cache.get(key)?;
    let entry: CacheEntry = ciborium::de::from_reader(reader).ok()?;
    let age = now_unix().saturating_sub(entry.fetched_at_unix);
    if age <= VERSION_LIST_TTL.as_secs() {
        Some(entry.project_info)
    } else {
        None
    }
}

/// Fetches and parses the simple-API project page for a single package,
/// returning `None` on a 404 (not an error -- per §4.4, a 404 on a
/// non-required source is not fatal; the caller decides whether the source
/// was required).
pub fn fetch_simple_api(
    http: &Http,
    version_list_cache: &KVFileStore,
    url: &Url,
) -> Result<Option<ProjectInfo>> {
    context!("Fetching simple API page for {}", url);

    let key = url.as_str().as_bytes();
    if let Some(cached) = read_fresh_cache(version_list_cache, key) {
        return Ok(Some(cached));
    }

    let request = http::Request::builder().uri(url.as_str()).body(())?;
    let response = http.request(request, CacheMode::Default)?;
    if response.status() == http::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status().is_success() {
        bail!(
            "fetching simple API page for {} failed: HTTP {}",
            url,
            response.status()
        );
    }
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/html")
        .to_string();
    let mut body = Vec::new();
    let (_parts, mut reader) = response.into_parts();
    reader.read_to_end(&mut body)?;

    let project_info = parse_html(url, &content_type, &body)?;

    let entry = CacheEntry {
        fetched_at_unix: now_unix(),
        project_info,
    };
    version_list_cache.get_or_set(key, |w| {
        ciborium::ser::into_writer(&entry, w)?;
        Ok(())
    })?;

    Ok(Some(entry.project_info))
}
