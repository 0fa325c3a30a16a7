//! CV addressing: compounding a 10-bit base index with optional paging
//! information (§4.2).

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CvError {
    #[error("base CV {0} out of range (1..=1024)")]
    BaseOutOfRange(u16),
    #[error("base CV {0} does not support paging")]
    PagingNotSupported(u16),
    #[error("SUSI page {0} out of range (1..=3)")]
    InvalidSusiPage(u16),
    #[error("extended variable index has no extended page (page kind is {0:?})")]
    NotExtendedPaged(PageKind),
    #[error("extended variable index has no SUSI page (page kind is {0:?})")]
    NotSusiPaged(PageKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    None,
    Extended,
    Susi1,
    Susi2,
    Susi3,
}

/// A base CV index (1..=1024) compounded with optional paging, so that CVs
/// beyond the 1024-index base range (extended pages via CV31/CV32, or SUSI
/// sub-modules via CV897) can be named as a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedVariableIndex {
    base: u16,
    page_kind: PageKind,
    page_value: u16,
}

/// Builds an `ExtendedVariableIndex` from a base CV and a page number.
///
/// `page == 0` always collapses to the plain, unpaged `base` regardless of
/// its range. A non-zero page requires `base` to fall in a paged range:
/// 257..=512 for the CV31/CV32 extended page, 897..=1024 for a SUSI
/// sub-module (page 1, 2, or 3).
pub fn extended_variable(base: u16, page: u16) -> Result<ExtendedVariableIndex, CvError> {
    if !(1..=1024).contains(&base) {
        return Err(CvError::BaseOutOfRange(base));
    }
    if page == 0 {
        return Ok(ExtendedVariableIndex {
            base,
            page_kind: PageKind::None,
            page_value: 0,
        });
    }
    let page_kind = match base {
        257..=512 => PageKind::Extended,
        897..=1024 => match page {
            1 => PageKind::Susi1,
            2 => PageKind::Susi2,
            3 => PageKind::Susi3,
            _ => return Err(CvError::InvalidSusiPage(page)),
        },
        _ => return Err(CvError::PagingNotSupported(base)),
    };
    Ok(ExtendedVariableIndex {
        base,
        page_kind,
        page_value: page,
    })
}

/// The flat base CV index, with paging information stripped off.
pub fn variable_index(ex: &ExtendedVariableIndex) -> u16 {
    ex.base
}

/// Decomposes an `ExtendedVariableIndex` back into `(base, page)`.
pub fn decompose(ex: &ExtendedVariableIndex) -> (u16, u16) {
    (ex.base, ex.page_value)
}

pub fn page_kind(ex: &ExtendedVariableIndex) -> PageKind {
    ex.page_kind
}

/// `(CV31, CV32)` to program before accessing an extended-page base CV.
pub fn extended_page(ex: &ExtendedVariableIndex) -> Result<(u8, u8), CvError> {
    if ex.page_kind != PageKind::Extended {
        return Err(CvError::NotExtendedPaged(ex.page_kind));
    }
    Ok(((ex.page_value >> 8) as u8, (ex.page_value & 0xFF) as u8))
}

/// The SUSI page register value (1, 2, or 3) to program before accessing a
/// SUSI sub-module base CV.
pub fn susi_page(ex: &ExtendedVariableIndex) -> Result<u8, CvError> {
    match ex.page_kind {
        PageKind::Susi1 => Ok(1),
        PageKind::Susi2 => Ok(2),
        PageKind::Susi3 => Ok(3),
        other => Err(CvError::NotSusiPaged(other)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unpaged_roundtrip() {
        let ex = extended_variable(29, 0).unwrap();
        assert_eq!(decompose(&ex), (29, 0));
        assert_eq!(page_kind(&ex), PageKind::None);
    }

    #[test]
    fn test_extended_page_roundtrip() {
        let ex = extended_variable(300, 0x0102).unwrap();
        assert_eq!(decompose(&ex), (300, 0x0102));
        assert_eq!(extended_page(&ex).unwrap(), (0x01, 0x02));
    }

    #[test]
    fn test_susi_page_roundtrip() {
        let ex = extended_variable(900, 2).unwrap();
        assert_eq!(page_kind(&ex), PageKind::Susi2);
        assert_eq!(susi_page(&ex).unwrap(), 2);
    }

    #[test]
    fn test_zero_page_collapses_regardless_of_base() {
        let ex = extended_variable(300, 0).unwrap();
        assert_eq!(page_kind(&ex), PageKind::None);
    }

    #[test]
    fn test_paging_not_supported_for_unpaged_range() {
        assert_eq!(
            extended_variable(50, 1),
            Err(CvError::PagingNotSupported(50))
        );
    }

    #[test]
    fn test_base_out_of_range() {
        assert_eq!(extended_variable(1025, 0), Err(CvError::BaseOutOfRange(1025)));
        assert_eq!(extended_variable(0, 0), Err(CvError::BaseOutOfRange(0)));
    }

    #[test]
    fn test_invalid_susi_page() {
        assert_eq!(extended_variable(900, 4), Err(CvError::InvalidSusiPage(4)));
    }

    #[test]
    fn test_extended_page_on_unpaged_index_errors() {
        let ex = extended_variable(29, 0).unwrap();
        assert!(extended_page(&ex).is_err());
        assert!(susi_page(&ex).is_err());
    }
}
