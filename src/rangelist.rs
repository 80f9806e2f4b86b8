//! Parsing and formatting of compact index range lists
//!
//! Range lists describe processor or node sets as strings such as
//! `"0-3,8,12-15"`. Items are separated by commas, colons or spaces; an
//! item is a single index or an inclusive `a-b` range with `a > b`
//! accepted and swapped.

use crate::error::{Error, Result};

/// Parse a range list into a sorted, deduplicated index list.
///
/// An empty expression yields an empty list. A range with more than one
/// dash is rejected.
pub fn parse_rangelist(expr: &str) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for item in expr.split([',', ':', ' ']) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut bounds = item.split('-');
        let start = parse_index(&mut bounds, expr)?;
        let stop = match bounds.next() {
            None => start,
            Some(s) => s.trim().parse::<usize>().map_err(|_| Error::MalformedRangeList {
                expr: expr.to_string(),
                details: "range bound is not an integer",
            })?,
        };
        if bounds.next().is_some() {
            return Err(Error::MalformedRangeList {
                expr: expr.to_string(),
                details: "more than one dash in a range",
            });
        }
        let (lo, hi) = if start <= stop { (start, stop) } else { (stop, start) };
        out.extend(lo..=hi);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn parse_index<'a>(bounds: &mut std::str::Split<'a, char>, expr: &str) -> Result<usize> {
    let piece = bounds.next().unwrap_or("");
    piece.trim().parse::<usize>().map_err(|_| Error::MalformedRangeList {
        expr: expr.to_string(),
        details: "range bound is not an integer",
    })
}

/// Format a sorted index list back into the compact range syntax.
///
/// Consecutive runs collapse to `a-b`; the output of `parse_rangelist`
/// round-trips through this function.
pub fn format_rangelist(indices: &[usize]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < indices.len() {
        let start = indices[i];
        let mut end = start;
        while i + 1 < indices.len() && indices[i + 1] == end + 1 {
            end = indices[i + 1];
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}-{}", start, end));
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn parses_singletons_and_ranges() {
        assert_eq!(parse_rangelist("0-3,8,12-15").unwrap(), vec![0, 1, 2, 3, 8, 12, 13, 14, 15]);
        assert_eq!(parse_rangelist("4").unwrap(), vec![4]);
    }

    #[test]
    fn accepts_alternate_separators() {
        assert_eq!(parse_rangelist("0:2 5").unwrap(), vec![0, 2, 5]);
    }

    #[test]
    fn swaps_reversed_ranges() {
        assert_eq!(parse_rangelist("3-1").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn deduplicates_overlaps() {
        assert_eq!(parse_rangelist("0-4,2-6").unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn rejects_double_dash() {
        assert!(parse_rangelist("1-2-3").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_rangelist("a-b").is_err());
    }

    #[test]
    fn empty_expression_is_empty_set() {
        assert_eq!(parse_rangelist("").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn formats_runs() {
        assert_eq!(format_rangelist(&[0, 1, 2, 3, 8, 12, 13, 14, 15]), "0-3,8,12-15");
        assert_eq!(format_rangelist(&[]), "");
        assert_eq!(format_rangelist(&[7]), "7");
    }

    #[quickcheck]
    fn round_trips_any_index_set(mut indices: Vec<u8>) -> bool {
        indices.sort_unstable();
        indices.dedup();
        let indices: Vec<usize> = indices.into_iter().map(usize::from).collect();
        let formatted = format_rangelist(&indices);
        parse_rangelist(&formatted).unwrap() == indices
    }
}
