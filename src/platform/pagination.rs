use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;
/// Keeps `offset` well inside i64 for any `per_page`.
pub const MAX_PAGE: i64 = 1_000_000;

#[derive(Deserialize, IntoParams, Debug, Default, Clone, Copy)]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    /// 1-based page number.
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl PageParams {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).clamp(1, MAX_PAGE)
    }

    pub fn per_page(&self) -> i64 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.per_page()
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, params: PageParams, total: i64) -> Self {
        Self {
            items,
            page: params.page(),
            per_page: params.per_page(),
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_first_page() {
        let params = PageParams::default();
        assert_eq!(params.page(), 1);
        assert_eq!(params.per_page(), DEFAULT_PER_PAGE);
        assert_eq!(params.offset(), 0);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let params = PageParams {
            page: Some(-3),
            per_page: Some(10_000),
        };
        assert_eq!(params.page(), 1);
        assert_eq!(params.per_page(), MAX_PER_PAGE);

        let params = PageParams {
            page: Some(3),
            per_page: Some(0),
        };
        assert_eq!(params.per_page(), 1);
        assert_eq!(params.offset(), 2);
    }

    #[test]
    fn offset_follows_page() {
        let params = PageParams {
            page: Some(4),
            per_page: Some(25),
        };
        assert_eq!(params.offset(), 75);
    }

    #[test]
    fn huge_pages_do_not_overflow() {
        let params = PageParams {
            page: Some(i64::MAX),
            per_page: Some(MAX_PER_PAGE),
        };
        assert_eq!(params.page(), MAX_PAGE);
        assert_eq!(params.offset(), (MAX_PAGE - 1) * MAX_PER_PAGE);
        assert!(params.offset() > 0);
    }
}
