//! Computational region files.
//!
//! A region file is a list of `key: value` lines:
//!
//! ```text
//! north:      228500
//! south:      215000
//! east:       645000
//! west:       630000
//! rows:       1350
//! cols:       1500
//! ```
//!
//! Only `rows` and `cols` are interpreted; everything else is kept verbatim.

use super::error::WorkspaceError;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub rows: u64,
    pub cols: u64,
    pub entries: BTreeMap<String, String>,
}

impl Region {
    pub fn parse(text: &str, source: &Path) -> Result<Self, WorkspaceError> {
        let entries: BTreeMap<String, String> = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .collect();

        let dimension = |key: &str| -> Result<u64, WorkspaceError> {
            entries
                .get(key)
                .ok_or_else(|| WorkspaceError::InvalidRegion {
                    path: source.to_path_buf(),
                    reason: format!("missing '{key}'"),
                })?
                .parse()
                .map_err(|e| WorkspaceError::InvalidRegion {
                    path: source.to_path_buf(),
                    reason: format!("bad '{key}': {e}"),
                })
        };

        Ok(Self {
            rows: dimension("rows")?,
            cols: dimension("cols")?,
            entries,
        })
    }

    pub fn read(path: &Path) -> Result<Self, WorkspaceError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Number of raster cells covered by the region.
    pub fn cells(&self) -> u64 {
        self.rows.saturating_mul(self.cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region() {
        let text = "proj: 99\nnorth:      228500\nrows:       1350\ncols:       1500\n";
        let region = Region::parse(text, Path::new("WIND")).unwrap();
        assert_eq!(region.rows, 1350);
        assert_eq!(region.cols, 1500);
        assert_eq!(region.cells(), 2_025_000);
        assert_eq!(region.entries.get("north").map(String::as_str), Some("228500"));
    }

    #[test]
    fn test_missing_dimension_is_an_error() {
        let err = Region::parse("rows: 10\n", Path::new("WIND")).unwrap_err();
        assert!(err.to_string().contains("cols"));
    }
}
