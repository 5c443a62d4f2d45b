//! Paging codec.
//!
//! Cursor paging (`first`/`after` forward, `last`/`before` backward) is
//! resolved into a plain [`LimitOffset`] window; offset paging is validated
//! and passed through. Keyset cursors live in [`keyset`].

pub mod cursor;
pub mod keyset;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ValidationErrors};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CursorPaging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OffsetPaging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Paging {
    Cursor(CursorPaging),
    Offset(OffsetPaging),
}

/// A resolved window. `None` means unbounded (limit) or from the start
/// (offset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOffset {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingDirection {
    Forward,
    Backward,
}

impl CursorPaging {
    pub fn forward(first: i64, after: Option<String>) -> Self {
        Self {
            first: Some(first),
            after,
            ..Self::default()
        }
    }

    pub fn backward(last: i64, before: impl Into<String>) -> Self {
        Self {
            last: Some(last),
            before: Some(before.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none() && self.last.is_none() && self.after.is_none() && self.before.is_none()
    }

    /// `None` when no paging was requested. Call [`CursorPaging::validate`]
    /// first; the direction of an invalid combination is meaningless.
    pub fn direction(&self) -> Option<PagingDirection> {
        if self.last.is_some() || self.before.is_some() {
            Some(PagingDirection::Backward)
        } else if self.first.is_some() || self.after.is_some() {
            Some(PagingDirection::Forward)
        } else {
            None
        }
    }

    /// Checks mode exclusivity, required companions, positive sizes and the
    /// page size cap. Cursors themselves are only decoded by the resolver.
    pub fn validate(&self, max_page_size: Option<u64>) -> Result<(), Error> {
        let mut errors = ValidationErrors::new();
        if self.first.is_some() && (self.before.is_some() || self.last.is_some()) {
            errors.push(
                "paging.first",
                "cannot be combined with before or last; use after to page forward",
            );
        }
        if self.last.is_some() && self.after.is_some() {
            errors.push(
                "paging.last",
                "cannot be combined with after; use before to page backward",
            );
        }
        if self.after.is_some() && self.first.is_none() {
            errors.push("paging.after", "requires first");
        }
        if self.before.is_some() && self.last.is_none() {
            errors.push("paging.before", "requires last");
        }
        for (path, size) in [("paging.first", self.first), ("paging.last", self.last)] {
            check_size(path, size, true, max_page_size, &mut errors);
        }
        errors.into_result()
    }

    /// Turns the cursor arguments into a window over offset cursors.
    ///
    /// A `before` cursor too close to the start shrinks the window instead of
    /// failing: `before = 1, last = 10` yields `limit 1, offset 0`.
    pub fn resolve(&self, max_page_size: Option<u64>) -> Result<LimitOffset, Error> {
        self.validate(max_page_size)?;
        match self.direction() {
            None => Ok(LimitOffset::default()),
            Some(PagingDirection::Forward) => {
                let offset = match &self.after {
                    Some(after) => cursor::decode(after, "paging.after")?.saturating_add(1),
                    None => 0,
                };
                Ok(LimitOffset {
                    limit: self.first.map(|first| first as u64),
                    offset: Some(offset.max(0) as u64),
                })
            }
            Some(PagingDirection::Backward) => {
                let last = self.last.unwrap_or_default();
                let before = match &self.before {
                    Some(before) => cursor::decode(before, "paging.before")?,
                    None => 0,
                };
                let start = before.saturating_sub(last);
                let limit = if start < 0 {
                    last.saturating_add(start).max(0)
                } else {
                    last
                };
                Ok(LimitOffset {
                    limit: Some(limit as u64),
                    offset: Some(start.max(0) as u64),
                })
            }
        }
    }
}

impl OffsetPaging {
    pub fn validate(&self, max_page_size: Option<u64>) -> Result<(), Error> {
        let mut errors = ValidationErrors::new();
        check_size("paging.limit", self.limit, false, max_page_size, &mut errors);
        if self.offset.is_some_and(|offset| offset < 0) {
            errors.push("paging.offset", "must not be negative");
        }
        errors.into_result()
    }

    pub fn resolve(&self, max_page_size: Option<u64>) -> Result<LimitOffset, Error> {
        self.validate(max_page_size)?;
        Ok(LimitOffset {
            limit: self.limit.map(|limit| limit as u64),
            offset: self.offset.map(|offset| offset as u64),
        })
    }
}

impl Paging {
    pub fn resolve(&self, max_page_size: Option<u64>) -> Result<LimitOffset, Error> {
        match self {
            Paging::Cursor(paging) => paging.resolve(max_page_size),
            Paging::Offset(paging) => paging.resolve(max_page_size),
        }
    }
}

fn check_size(
    path: &str,
    size: Option<i64>,
    positive: bool,
    max_page_size: Option<u64>,
    errors: &mut ValidationErrors,
) {
    let Some(size) = size else {
        return;
    };
    if positive && size <= 0 {
        errors.push(path, "must be a positive integer");
    } else if size < 0 {
        errors.push(path, "must not be negative");
    } else if let Some(max) = max_page_size.filter(|max| size as u64 > *max) {
        errors.push(path, format!("must not exceed the page size limit of {}", max));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn after(n: i64) -> String {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        STANDARD.encode(format!("arrayconnection:{}", n))
    }

    #[test]
    fn no_paging_resolves_to_nothing() {
        assert_eq!(
            CursorPaging::default().resolve(None).unwrap(),
            LimitOffset::default()
        );
    }

    #[test]
    fn forward_paging() {
        assert_eq!(
            CursorPaging::forward(2, None).resolve(None).unwrap(),
            LimitOffset {
                limit: Some(2),
                offset: Some(0)
            }
        );
        assert_eq!(
            CursorPaging::forward(2, Some(cursor::encode(1)))
                .resolve(None)
                .unwrap(),
            LimitOffset {
                limit: Some(2),
                offset: Some(2)
            }
        );
    }

    #[test]
    fn forward_negative_after_clamps_to_start() {
        assert_eq!(
            CursorPaging::forward(10, Some(after(-10)))
                .resolve(None)
                .unwrap(),
            LimitOffset {
                limit: Some(10),
                offset: Some(0)
            }
        );
    }

    #[test]
    fn backward_paging() {
        assert_eq!(
            CursorPaging::backward(2, cursor::encode(4))
                .resolve(None)
                .unwrap(),
            LimitOffset {
                limit: Some(2),
                offset: Some(2)
            }
        );
    }

    #[test]
    fn backward_underflow_shrinks_the_window() {
        assert_eq!(
            CursorPaging::backward(10, cursor::encode(1))
                .resolve(None)
                .unwrap(),
            LimitOffset {
                limit: Some(1),
                offset: Some(0)
            }
        );
    }

    #[test]
    fn mixed_or_incomplete_modes_fail() {
        let cases = [
            CursorPaging {
                first: Some(10),
                before: Some(cursor::encode(1)),
                ..Default::default()
            },
            CursorPaging {
                last: Some(10),
                after: Some(cursor::encode(1)),
                ..Default::default()
            },
            CursorPaging {
                after: Some(cursor::encode(1)),
                ..Default::default()
            },
            CursorPaging {
                before: Some(cursor::encode(1)),
                ..Default::default()
            },
            CursorPaging {
                first: Some(0),
                ..Default::default()
            },
            CursorPaging {
                last: Some(-1),
                before: Some(cursor::encode(1)),
                ..Default::default()
            },
        ];
        for paging in cases {
            assert!(paging.resolve(None).unwrap_err().is_validation(), "{paging:?}");
        }
    }

    #[test]
    fn page_size_cap_applies_to_every_mode() {
        assert!(CursorPaging::forward(51, None).resolve(Some(50)).is_err());
        assert!(
            CursorPaging::backward(51, cursor::encode(100))
                .resolve(Some(50))
                .is_err()
        );
        let offset = OffsetPaging {
            limit: Some(51),
            offset: None,
        };
        assert!(offset.resolve(Some(50)).unwrap_err().is_validation());
        assert!(offset.resolve(None).is_ok());
    }

    #[test]
    fn offset_paging_rejects_negatives() {
        let paging = OffsetPaging {
            limit: Some(-1),
            offset: Some(-1),
        };
        let Error::Validation(errors) = paging.resolve(None).unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn deserializes_either_paging_shape() {
        let cursor: Paging = serde_json::from_value(json!({"first": 2})).unwrap();
        assert_eq!(cursor, Paging::Cursor(CursorPaging::forward(2, None)));
        let offset: Paging = serde_json::from_value(json!({"limit": 5, "offset": 10})).unwrap();
        assert_eq!(
            offset,
            Paging::Offset(OffsetPaging {
                limit: Some(5),
                offset: Some(10)
            })
        );
    }
}
