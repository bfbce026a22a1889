/// Rounds `value` up to the next multiple of `page`.
///
/// Works for any non-zero `page`, not only powers of two. The caller is
/// responsible for making sure the addition cannot overflow; use
/// [`round_up`] when the input is untrusted.
///
/// # Examples
///
/// ```rust
/// use mems::page_align;
///
/// assert_eq!(page_align!(1, 4096), 4096);
/// assert_eq!(page_align!(4096, 4096), 4096);
/// assert_eq!(page_align!(4097, 4096), 8192);
/// assert_eq!(page_align!(10, 3), 12);
/// ```
#[macro_export]
macro_rules! page_align {
  ($value:expr, $page:expr) => {
    (($value) + ($page) - 1) / ($page) * ($page)
  };
}

/// Checked version of [`page_align!`]. Returns `None` on overflow.
pub fn round_up(
  value: usize,
  page: usize,
) -> Option<usize> {
  if page == 0 {
    return None;
  }

  let pages = value.checked_add(page - 1)? / page;
  pages.checked_mul(page)
}
