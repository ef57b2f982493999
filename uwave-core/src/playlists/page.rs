/// An offset/limit window over a playlist's items.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of playlist items.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub page_size: usize,
    /// Total number of items in the playlist
    pub total: usize,
    /// Number of items matching the filter, when one was applied
    pub filtered: Option<usize>,
}

impl<T> Page<T> {
    /// The number of items pagination runs over: the filtered count if a
    /// filter was applied, the playlist size otherwise.
    pub fn relevant(&self) -> usize {
        self.filtered.unwrap_or(self.total)
    }

    pub fn next_offset(&self) -> Option<usize> {
        let next = self.offset + self.page_size;
        (next < self.relevant()).then_some(next)
    }

    pub fn previous_offset(&self) -> Option<usize> {
        (self.offset > 0).then(|| self.offset.saturating_sub(self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(offset: usize, total: usize, filtered: Option<usize>) -> Page<u8> {
        Page {
            items: vec![],
            offset,
            page_size: 10,
            total,
            filtered,
        }
    }

    #[test]
    fn test_offsets() {
        let first = page(0, 25, None);
        assert_eq!(first.next_offset(), Some(10));
        assert_eq!(first.previous_offset(), None, "first page has no previous");

        let last = page(20, 25, None);
        assert_eq!(last.next_offset(), None, "last page has no next");
        assert_eq!(last.previous_offset(), Some(10));
    }

    #[test]
    fn test_filtered_count_drives_pagination() {
        let filtered = page(0, 100, Some(8));

        assert_eq!(
            filtered.next_offset(),
            None,
            "eight matches fit on one page"
        );
    }
}
