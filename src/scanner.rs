use std::fs;
use std::io;

use camino::Utf8Path;
use tracing::warn;

use crate::error::CatalogError;

pub const DEFAULT_EXTENSION: &str = "nc";

/// Year coverage of one archive directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub start_exists: bool,
    pub end_exists: bool,
    pub earliest: Option<i32>,
    pub latest: Option<i32>,
}

/// Reads year tokens from file names in a directory.
///
/// A file belongs to a year when the last `_`-delimited segment of its stem is
/// all digits. `YYYYMM` and `YYYYMMDD` tokens count towards their year.
#[derive(Debug, Clone)]
pub struct ArchiveScanner {
    extension: String,
}

impl Coverage {
    fn from_years(years: &[i32], start: i32, end: i32) -> Self {
        Self {
            start_exists: years.contains(&start),
            end_exists: years.contains(&end),
            earliest: years.iter().min().copied(),
            latest: years.iter().max().copied(),
        }
    }
}

impl Default for ArchiveScanner {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSION)
    }
}

impl ArchiveScanner {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn exists_for_year(&self, dir: &Utf8Path, year: i32) -> bool {
        self.years_or_empty(dir).contains(&year)
    }

    pub fn year_bounds(&self, dir: &Utf8Path) -> (Option<i32>, Option<i32>) {
        let years = self.years_or_empty(dir);
        (years.iter().min().copied(), years.iter().max().copied())
    }

    /// One listing for the boundary checks and the bounds.
    ///
    /// A missing directory is empty coverage; an unreadable one is a
    /// [`CatalogError::ScanIo`] so callers can decide how loudly to report it.
    pub fn scan(&self, dir: &Utf8Path, start: i32, end: i32) -> Result<Coverage, CatalogError> {
        let years = self.years(dir, None)?;
        Ok(Coverage::from_years(&years, start, end))
    }

    /// Like [`scan`](Self::scan), but only files named `{stem}_{token}.{ext}`
    /// count. Used where several simulations share one directory.
    pub fn scan_stem(
        &self,
        dir: &Utf8Path,
        stem: &str,
        start: i32,
        end: i32,
    ) -> Result<Coverage, CatalogError> {
        let years = self.years(dir, Some(stem))?;
        Ok(Coverage::from_years(&years, start, end))
    }

    fn years_or_empty(&self, dir: &Utf8Path) -> Vec<i32> {
        self.years(dir, None).unwrap_or_else(|err| {
            warn!("{err}");
            Vec::new()
        })
    }

    fn years(&self, dir: &Utf8Path, stem: Option<&str>) -> Result<Vec<i32>, CatalogError> {
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CatalogError::ScanIo {
                    path: dir.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };

        let mut years = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::ScanIo {
                path: dir.to_path_buf(),
                message: err.to_string(),
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let name = match stem {
                Some(stem) => match name
                    .strip_prefix(stem)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .filter(|rest| !rest.contains('_'))
                {
                    Some(rest) => rest,
                    None => continue,
                },
                None => name,
            };
            if let Some(year) = year_token(name, &self.extension) {
                years.push(year);
            }
        }
        Ok(years)
    }
}

/// Year encoded in `name`, if it carries the extension and a numeric token.
pub fn year_token(name: &str, extension: &str) -> Option<i32> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let token = stem.rsplit('_').next()?;
    if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    match token.len() {
        6 | 8 => token[..4].parse().ok(),
        _ => token.parse().ok(),
    }
}
