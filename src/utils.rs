use crate::CaptureError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Turn a page title into a token usable as a file and folder name.
///
/// Path-special characters become `_` and every whitespace run collapses into a
/// single `_`.
pub fn sanitize_title(input: &str) -> String {
    let replaced: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() && !c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    replaced.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Last non-empty path segment of a URL, used when a document has no title.
pub fn title_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(sanitize_title)
        .filter(|segment| !segment.is_empty())
}

/// Rewrite (or append) the `#p=<n>` fragment parameter the viewer reads its
/// current page from.
pub fn update_page_param(url: &str, page: u32) -> String {
    if let Some(start) = url.find("#p=") {
        let digits_start = start + 3;
        let digits_len = url[digits_start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .count();
        return format!(
            "{}{}{}",
            &url[..digits_start],
            page,
            &url[digits_start + digits_len..]
        );
    }

    match url.find('#') {
        Some(idx) if idx + 1 == url.len() => format!("{url}p={page}"),
        Some(_) => format!("{url}&p={page}"),
        None => format!("{url}#p={page}"),
    }
}

/// Extract the target of a CSS `url(...)` expression as returned by
/// `getComputedStyle(..).backgroundImage`.
///
/// A quoted target runs to its closing quote, so parentheses inside it are
/// kept. The target is percent-decoded before parsing.
///
/// Returns `None` for `none`, gradients, or anything that is not an absolute
/// http(s) URL.
pub fn parse_css_url(value: &str) -> Option<Url> {
    let value = value.trim();
    let rest = value[value.find("url(")? + 4..].trim_start();
    let inner = match rest.chars().next()? {
        quote @ ('"' | '\'') => {
            let body = &rest[1..];
            &body[..body.find(quote)?]
        }
        _ => rest[..rest.find(')')?].trim_end(),
    };

    let decoded = urlencoding::decode(inner).ok()?;
    let parsed = Url::parse(&decoded).ok()?;
    match parsed.scheme() {
        "http" | "https" => Some(parsed),
        _ => None,
    }
}

/// Check a submitted URL against the required host/path prefix.
pub fn validate_flipbook_url(url: &str, prefix: &str) -> Result<Url, CaptureError> {
    let trimmed = url.trim();
    if !trimmed.starts_with(prefix) {
        return Err(CaptureError::InvalidUrl(format!(
            "{trimmed} (expected prefix {prefix})"
        )));
    }

    let parsed = Url::parse(trimmed).map_err(|e| CaptureError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(CaptureError::InvalidUrl(format!(
            "unsupported scheme {scheme}"
        ))),
    }
}

/// Run a fallible step unless the token fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, step: F) -> Result<T, CaptureError>
where
    F: Future<Output = Result<T, CaptureError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CaptureError::Cancelled),
        result = step => result,
    }
}

/// Sleep that ends early with `Cancelled` on stop.
pub async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), CaptureError> {
    cancellable(cancel, async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("My Book"), "My_Book");
        assert_eq!(sanitize_title("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_title("  Many   spaces\there "), "Many_spaces_here");
        assert_eq!(sanitize_title("what?<now>|\"*"), "what__now____");
        assert_eq!(sanitize_title(""), "");
    }

    #[test]
    fn test_title_from_url() {
        assert_eq!(
            title_from_url("https://site.example/doc1#p=1"),
            Some("doc1".to_string())
        );
        assert_eq!(
            title_from_url("https://online.fliphtml5.com/abcd/efgh/"),
            Some("efgh".to_string())
        );
        assert_eq!(title_from_url("https://site.example/"), None);
        assert_eq!(title_from_url("not a url"), None);
    }

    #[test]
    fn test_update_page_param_replaces_existing() {
        assert_eq!(
            update_page_param("https://x/abc/#p=3", 999),
            "https://x/abc/#p=999"
        );
        assert_eq!(
            update_page_param("https://x/abc/#p=12&z=1", 1),
            "https://x/abc/#p=1&z=1"
        );
    }

    #[test]
    fn test_update_page_param_appends() {
        assert_eq!(update_page_param("https://x/abc/", 999), "https://x/abc/#p=999");
        assert_eq!(update_page_param("https://x/abc/#", 999), "https://x/abc/#p=999");
        assert_eq!(
            update_page_param("https://x/abc/#zoom=2", 999),
            "https://x/abc/#zoom=2&p=999"
        );
    }

    #[test]
    fn test_parse_css_url() {
        let url = parse_css_url(r#"url("https://cdn.example/files/bg%20one.png")"#).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/files/bg%20one.png");

        assert!(parse_css_url("url('http://cdn.example/a.jpg')").is_some());
        assert!(parse_css_url("url(https://cdn.example/b.jpg)").is_some());
        assert!(parse_css_url("none").is_none());
        assert!(parse_css_url("linear-gradient(red, blue)").is_none());
        assert!(parse_css_url(r#"url("data:image/png;base64,AAAA")"#).is_none());
    }

    #[test]
    fn test_parse_css_url_keeps_parentheses_in_quoted_target() {
        let url = parse_css_url(r#"url("https://cdn.example/img/bg(1).png")"#).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/img/bg(1).png");

        let url = parse_css_url("url('https://cdn.example/img/bg(2).png')").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/img/bg(2).png");
    }

    #[test]
    fn test_parse_css_url_percent_decodes_target() {
        let url = parse_css_url(r#"url("https://cdn.example/files%2Fbooks/bg.png")"#).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/files/books/bg.png");

        let url = parse_css_url(r#"url("https://cdn.example/bg.png%3Fv%3D2")"#).unwrap();
        assert_eq!(url.path(), "/bg.png");
        assert_eq!(url.query(), Some("v=2"));
    }

    #[test]
    fn test_validate_flipbook_url() {
        let prefix = "https://online.fliphtml5.com/";
        assert!(validate_flipbook_url("https://online.fliphtml5.com/abc/def/", prefix).is_ok());
        assert!(validate_flipbook_url("  https://online.fliphtml5.com/abc/ ", prefix).is_ok());
        assert!(validate_flipbook_url("https://example.com/abc", prefix).is_err());
        assert!(validate_flipbook_url("", prefix).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[tokio::test]
    async fn test_pause_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pause(&cancel, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(CaptureError::Cancelled)));
    }
}
