//! Flash image paging.
//!
//! An image is cut into fixed-size pages. The last page is right-padded with
//! a fill byte so every transfer is exactly [`PAGE_SIZE`] bytes; the padding
//! never becomes part of the image itself.

/// Size of one flash page in bytes.
pub const PAGE_SIZE: usize = 256;

/// Default fill byte for the final page (erased NOR flash state).
pub const DEFAULT_FILL_BYTE: u8 = 0xFF;

/// One fixed-size page of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Page index within the image.
    pub index: u32,
    /// Page payload, always [`PAGE_SIZE`] bytes.
    pub bytes: [u8; PAGE_SIZE],
}

/// Immutable view of an image as a sequence of pages.
#[derive(Debug, Clone, Copy)]
pub struct PagedImage<'a> {
    data: &'a [u8],
    fill_byte: u8,
}

impl<'a> PagedImage<'a> {
    /// Page `data` with the default fill byte.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_fill_byte(data, DEFAULT_FILL_BYTE)
    }

    /// Page `data`, padding the final page with `fill_byte`.
    pub fn with_fill_byte(data: &'a [u8], fill_byte: u8) -> Self {
        Self { data, fill_byte }
    }

    /// Length of the image without padding.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// Fill byte used for padding.
    pub fn fill_byte(&self) -> u8 {
        self.fill_byte
    }

    /// Number of pages, `ceil(len / PAGE_SIZE)`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn page_count(&self) -> u32 {
        // Images are bounded by SPI flash sizes, far below 2^32 pages.
        self.len()
            .div_ceil(PAGE_SIZE) as u32
    }

    /// Length including padding; always a multiple of [`PAGE_SIZE`].
    pub fn padded_len(&self) -> usize {
        self.page_count() as usize * PAGE_SIZE
    }

    /// Page `index`, or `None` past the end.
    pub fn page(&self, index: u32) -> Option<Page> {
        if index >= self.page_count() {
            return None;
        }
        let start = index as usize * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(self.len());
        let chunk = &self.data[start..end];

        let mut bytes = [self.fill_byte; PAGE_SIZE];
        bytes[..chunk.len()].copy_from_slice(chunk);
        Some(Page { index, bytes })
    }

    /// Iterate over all pages in order.
    pub fn pages(&self) -> impl Iterator<Item = Page> + '_ {
        (0..self.page_count()).filter_map(move |i| self.page(i))
    }
}
