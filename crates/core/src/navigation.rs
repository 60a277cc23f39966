//! Navigation context propagation
//!
//! While a delegated view is active, the viewed target travels with every
//! in-app URL as a `view_as` query parameter. On load the parameter is
//! recovered and fed back to the manager as a navigation hint, which only
//! selects among store-confirmed sessions; a stale or forged parameter
//! never grants access by itself.

use mentorview_protocol::ViewContext;

const VIEW_AS_PARAM: &str = "view_as";

/// Rewrite a URL so it carries the current delegation context. Any existing
/// `view_as` parameter is dropped first, so the result always reflects the
/// context passed in; other query parameters and the fragment survive.
pub fn decorate(url: &str, context: &ViewContext) -> String {
    let (base, fragment) = split_fragment(url);
    let (path, query) = split_query(base);

    let mut pairs: Vec<(String, String)> = parse_query(query)
        .into_iter()
        .filter(|(key, _)| key != VIEW_AS_PARAM)
        .collect();

    if let Some(viewing) = &context.viewing {
        pairs.push((VIEW_AS_PARAM.to_string(), viewing.target_id.clone()));
    }

    let mut out = path.to_string();
    if !pairs.is_empty() {
        out.push('?');
        let encoded: Vec<String> = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        out.push_str(&encoded.join("&"));
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Recover the delegated target carried by a URL, if any
pub fn extract_target(url: &str) -> Option<String> {
    let (base, _) = split_fragment(url);
    let (_, query) = split_query(base);
    parse_query(query)
        .into_iter()
        .find(|(key, _)| key == VIEW_AS_PARAM)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn split_fragment(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                urlencoding::decode(key).map(|c| c.into_owned()).unwrap_or_else(|_| key.to_string()),
                urlencoding::decode(value).map(|c| c.into_owned()).unwrap_or_else(|_| value.to_string()),
            )
        })
        .collect()
}
