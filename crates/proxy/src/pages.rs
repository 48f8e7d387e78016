//! Built-in HTML pages for blocked requests and upstream failures
//!
//! Each page can be overridden by a file under `<template_dir>/templates/`.
//! The file is read on every use so edits take effect without a restart.

use crate::response::GatewayResponse;
use http::StatusCode;
use std::path::{Path, PathBuf};
use tracing::debug;

const FORBIDDEN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>403 Forbidden</title></head>
<body>
<h1>403 Forbidden</h1>
<p>Your request has been blocked by the gateway access policy.</p>
</body>
</html>
"#;

const HOST_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Host Not Found</title></head>
<body>
<h1>Host Not Found</h1>
<p>The upstream server for this site could not be resolved.</p>
</body>
</html>
"#;

const PROXY_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>521 - Web Server is Down</title></head>
<body>
<h1>521 - Web Server is Down</h1>
<p>The gateway could not reach the upstream server.</p>
</body>
</html>
"#;

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>404 Not Found</title></head>
<body>
<h1>404 Not Found</h1>
</body>
</html>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Blacklist,
    Whitelist,
    HostError,
    ProxyError,
    NotFound,
}

impl Page {
    fn file_name(&self) -> &'static str {
        match self {
            Page::Blacklist => "blacklist.html",
            Page::Whitelist => "whitelist.html",
            Page::HostError => "hosterror.html",
            Page::ProxyError => "rperror.html",
            Page::NotFound => "notfound.html",
        }
    }

    fn fallback(&self) -> &'static str {
        match self {
            Page::Blacklist | Page::Whitelist => FORBIDDEN_PAGE,
            Page::HostError => HOST_ERROR_PAGE,
            Page::ProxyError => PROXY_ERROR_PAGE,
            Page::NotFound => NOT_FOUND_PAGE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pages {
    template_dir: Option<PathBuf>,
}

impl Pages {
    pub fn new(template_dir: Option<&Path>) -> Self {
        Self {
            template_dir: template_dir.map(Path::to_path_buf),
        }
    }

    /// Page body, from the template directory when present
    pub fn body(&self, page: Page) -> String {
        if let Some(dir) = &self.template_dir {
            let path = dir.join("templates").join(page.file_name());
            match std::fs::read_to_string(&path) {
                Ok(content) => return content,
                Err(e) => debug!(path = ?path, error = %e, "Using built-in page"),
            }
        }
        page.fallback().to_string()
    }

    pub fn render(&self, page: Page, status: StatusCode) -> GatewayResponse {
        GatewayResponse::html(status, self.body(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fallback_without_template_dir() {
        let pages = Pages::default();
        let resp = pages.render(Page::Blacklist, StatusCode::FORBIDDEN);
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert_eq!(resp.header("Content-Type"), Some("text/html; charset=utf-8"));
        assert!(String::from_utf8_lossy(&resp.body).contains("403 Forbidden"));
    }

    #[test]
    fn test_template_override() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/whitelist.html"), "<p>not on the list</p>").unwrap();

        let pages = Pages::new(Some(dir.path()));
        assert_eq!(pages.body(Page::Whitelist), "<p>not on the list</p>");
        // Missing template falls back
        assert!(pages.body(Page::Blacklist).contains("403 Forbidden"));
    }
}
