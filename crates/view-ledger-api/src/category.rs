use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use view_ledger_core::CategoryKey;

/// Lookup used to check that a category referenced by a view exists.
pub trait CategoryDirectory {
    /// # Errors
    /// Returns an error when the directory cannot answer. A missing category
    /// is `Ok(false)`, not an error.
    fn exists(&self, category: CategoryKey) -> Result<bool>;
}

impl<T: CategoryDirectory + ?Sized> CategoryDirectory for Box<T> {
    fn exists(&self, category: CategoryKey) -> Result<bool> {
        (**self).exists(category)
    }
}

/// Accepts every well-formed category key.
#[derive(Debug, Clone, Copy, Default)]
pub struct UncheckedDirectory;

impl CategoryDirectory for UncheckedDirectory {
    fn exists(&self, _category: CategoryKey) -> Result<bool> {
        Ok(true)
    }
}

/// Fixed set of known categories.
#[derive(Debug, Clone, Default)]
pub struct KnownCategories(BTreeSet<CategoryKey>);

impl KnownCategories {
    #[must_use]
    pub fn new(categories: impl IntoIterator<Item = CategoryKey>) -> Self {
        Self(categories.into_iter().collect())
    }
}

impl CategoryDirectory for KnownCategories {
    fn exists(&self, category: CategoryKey) -> Result<bool> {
        Ok(self.0.contains(&category))
    }
}

/// Category service reached over HTTP at `{base_url}/v1/categories/{key}`.
#[derive(Clone)]
pub struct HttpCategoryDirectory {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpCategoryDirectory {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(5))
    }

    #[must_use]
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { base_url, agent }
    }

    fn category_url(&self, category: CategoryKey) -> String {
        format!("{}/v1/categories/{category}", self.base_url)
    }
}

impl CategoryDirectory for HttpCategoryDirectory {
    fn exists(&self, category: CategoryKey) -> Result<bool> {
        let url = self.category_url(category);
        match self.agent.get(&url).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(ureq::Error::Status(status, _)) => {
                Err(anyhow!("category directory returned HTTP {status} for {url}"))
            }
            Err(err) => Err(anyhow!("category directory request to {url} failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Serve one canned status line per accepted connection, in order.
    fn serve_statuses(statuses: &'static [&'static str]) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        thread::spawn(move || {
            for status in statuses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0_u8; 1024];
                let _ = stream.read(&mut buf);
                let response =
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes());
            }
        });
        Ok(format!("http://{addr}"))
    }

    #[test]
    fn http_directory_maps_status_codes() -> Result<()> {
        let base_url = serve_statuses(&["200 OK", "404 Not Found", "500 Internal Server Error"])?;
        let directory = HttpCategoryDirectory::new(base_url);

        assert!(directory.exists(CategoryKey::new())?);
        assert!(!directory.exists(CategoryKey::new())?);
        assert!(directory.exists(CategoryKey::new()).is_err());
        Ok(())
    }

    #[test]
    fn known_categories_only_accepts_members() -> Result<()> {
        let member = CategoryKey::new();
        let directory = KnownCategories::new([member]);
        assert!(directory.exists(member)?);
        assert!(!directory.exists(CategoryKey::new())?);
        Ok(())
    }

    #[test]
    fn boxed_directories_delegate() -> Result<()> {
        let directory: Box<dyn CategoryDirectory> = Box::new(UncheckedDirectory);
        assert!(directory.exists(CategoryKey::new())?);
        Ok(())
    }

    #[test]
    fn http_directory_builds_category_urls_without_double_slashes() {
        let directory = HttpCategoryDirectory::new("http://categories.local/");
        let category = CategoryKey::new();
        assert_eq!(
            directory.category_url(category),
            format!("http://categories.local/v1/categories/{category}")
        );
    }

    #[test]
    fn unreachable_http_directory_is_an_error() {
        let directory =
            HttpCategoryDirectory::with_timeout("http://127.0.0.1:9", Duration::from_millis(200));
        assert!(directory.exists(CategoryKey::new()).is_err());
    }
}
