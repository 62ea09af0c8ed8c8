use super::sql::Pagination;

/// Rows per page when browsing a table without an explicit limit.
pub const TABLE_PAGE_LIMIT: usize = 50;

/// Caps a caller-supplied page size at `max_rows`. An absent size stays
/// absent so paging written into the SQL itself still applies.
pub fn cap_page_size(size: Option<usize>, max_rows: usize) -> Option<usize> {
    size.filter(|&s| s >= 1).map(|s| s.min(max_rows.max(1)))
}

/// Page window for table browsing: page defaults to 1, limit to
/// [`TABLE_PAGE_LIMIT`], and the limit never exceeds `max_rows`.
pub fn table_page(page: Option<usize>, limit: Option<usize>, max_rows: usize) -> Pagination {
    let page = page.filter(|&p| p >= 1).unwrap_or(1);
    let size = cap_page_size(limit, max_rows).unwrap_or(TABLE_PAGE_LIMIT.min(max_rows.max(1)));
    Pagination { page, size }
}

pub fn total_pages(total: i64, size: usize) -> i64 {
    let size = i64::try_from(size.max(1)).unwrap_or(i64::MAX);
    let total = total.max(0);
    total / size + i64::from(total % size != 0)
}
