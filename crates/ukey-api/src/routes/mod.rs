//! REST route modules.

pub mod api_keys;
pub mod auth;
pub mod device_groups;
pub mod devices;
pub mod health;
pub mod sessions;
pub mod users;

use serde::Deserialize;

/// Shared list pagination query (`?page=1&page_size=20`).
#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl Pagination {
    /// Clamped (limit, offset) pair.
    pub fn limits(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self.page_size.unwrap_or(20).clamp(1, 100);
        (page_size, (page - 1) * page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_clamps() {
        let (limit, offset) = Pagination { page: None, page_size: None }.limits();
        assert_eq!((limit, offset), (20, 0));

        let (limit, offset) = Pagination { page: Some(3), page_size: Some(10) }.limits();
        assert_eq!((limit, offset), (10, 20));

        let (limit, _) = Pagination { page: Some(0), page_size: Some(1000) }.limits();
        assert_eq!(limit, 100);
    }
}
