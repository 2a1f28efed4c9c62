//! CSV time-series store: one file per (symbol, interval).
//!
//! Layout: `{root}/{interval}/{SYMBOL}.csv` with header
//! `timestamp,open,high,low,close,volume`, rows ascending by timestamp.
//!
//! - Atomic writes (write `.csv.tmp` in the same directory, fsync, rename,
//!   fsync the directory so the rename itself survives a crash)
//! - Boundary reads (header + first row, seek to the tail for the last row)
//! - Strict loads that reject any unparseable row
//! - Lenient loads that salvage parseable rows from a corrupt file

use super::timestamp::{format_timestamp, parse_timestamp};
use crate::domain::{Candle, Interval, StoreKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HEADER: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Bytes read from the end of the file per tail-read attempt.
const TAIL_CHUNK: u64 = 4096;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {} is corrupt at {location}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        location: String,
        reason: String,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// First and last rows of a store, read without parsing the body.
#[derive(Debug, Clone, PartialEq)]
pub enum Boundary {
    Missing,
    Empty,
    Rows { first: Candle, last: Candle },
}

/// Result of salvaging a possibly corrupt store.
#[derive(Debug, Clone, PartialEq)]
pub struct Salvage {
    pub candles: Vec<Candle>,
    pub dropped_rows: usize,
    pub duplicate_rows: usize,
}

/// Summary line for one store, computed from its boundary and size.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStat {
    pub key: StoreKey,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub rows: usize,
    pub size_bytes: u64,
}

pub struct CsvStore {
    root: PathBuf,
}

impl CsvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &StoreKey) -> PathBuf {
        key.path(&self.root)
    }

    pub fn exists(&self, key: &StoreKey) -> bool {
        self.path(key).is_file()
    }

    /// Every store present for an interval, sorted by symbol.
    pub fn list_keys(&self, interval: Interval) -> Result<Vec<StoreKey>, StoreError> {
        let dir = StoreKey::interval_dir(&self.root, interval);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.clone(),
                source,
            })?;
            if let Some(key) = StoreKey::from_path(&entry.path(), interval) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Load every row, failing on the first unparseable one.
    ///
    /// An absent store loads as an empty series.
    pub fn load(&self, key: &StoreKey) -> Result<Vec<Candle>, StoreError> {
        let path = self.path(key);
        let Some(file) = open_if_exists(&path)? else {
            return Ok(Vec::new());
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut candles = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let line = i as u64 + 1;
            let record = record.map_err(|e| corrupt(&path, format!("line {line}"), e.to_string()))?;
            if i == 0 {
                check_header(&record).map_err(|reason| corrupt(&path, "line 1", reason))?;
                continue;
            }
            let candle =
                parse_record(&record).map_err(|reason| corrupt(&path, format!("line {line}"), reason))?;
            candles.push(candle);
        }
        Ok(candles)
    }

    /// Sequential scan for downstream readers; rows are yielded in file order.
    pub fn scan(
        &self,
        key: &StoreKey,
    ) -> Result<impl Iterator<Item = Result<Candle, StoreError>>, StoreError> {
        let path = self.path(key);
        let file = File::open(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut records = rdr.records();
        match records.next() {
            Some(Ok(header)) => {
                check_header(&header).map_err(|reason| corrupt(&path, "line 1", reason))?
            }
            Some(Err(e)) => return Err(corrupt(&path, "line 1", e.to_string())),
            None => {}
        }

        Ok(rdr.into_records().enumerate().map(move |(i, record)| {
            let location = format!("line {}", i + 2);
            record
                .map_err(|e| corrupt(&path, location.clone(), e.to_string()))
                .and_then(|r| parse_record(&r).map_err(|reason| corrupt(&path, location, reason)))
        }))
    }

    /// Salvage parseable, finite rows, sorted and deduplicated (later rows win).
    pub fn load_lenient(&self, key: &StoreKey) -> Result<Salvage, StoreError> {
        let path = self.path(key);
        let Some(file) = open_if_exists(&path)? else {
            return Ok(Salvage {
                candles: Vec::new(),
                dropped_rows: 0,
                duplicate_rows: 0,
            });
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut dropped_rows = 0;
        let mut duplicate_rows = 0;
        for (i, record) in rdr.records().enumerate() {
            let Ok(record) = record else {
                dropped_rows += 1;
                continue;
            };
            if i == 0 && check_header(&record).is_ok() {
                continue;
            }
            match parse_record(&record) {
                Ok(candle) if candle.is_finite() => {
                    if by_time.insert(candle.open_time_ms(), candle).is_some() {
                        duplicate_rows += 1;
                    }
                }
                _ => dropped_rows += 1,
            }
        }

        Ok(Salvage {
            candles: by_time.into_values().collect(),
            dropped_rows,
            duplicate_rows,
        })
    }

    /// Read the first and last rows only.
    pub fn read_boundary(&self, key: &StoreKey) -> Result<Boundary, StoreError> {
        let path = self.path(key);
        let Some(file) = open_if_exists(&path)? else {
            return Ok(Boundary::Missing);
        };

        let mut reader = BufReader::new(file);
        let mut header = String::new();
        read_line(&mut reader, &mut header, &path)?;
        if header.trim().is_empty() {
            return Ok(Boundary::Empty);
        }
        check_header_line(&header).map_err(|reason| corrupt(&path, "line 1", reason))?;

        let mut first_line = String::new();
        loop {
            first_line.clear();
            if read_line(&mut reader, &mut first_line, &path)? == 0 {
                return Ok(Boundary::Empty);
            }
            if !first_line.trim().is_empty() {
                break;
            }
        }
        let first = parse_line(&first_line).map_err(|reason| corrupt(&path, "first row", reason))?;

        let mut file = reader.into_inner();
        let last_line = read_last_line(&mut file, &path)?;
        let last = parse_line(&last_line).map_err(|reason| corrupt(&path, "last row", reason))?;

        Ok(Boundary::Rows { first, last })
    }

    /// Open time of the last stored row, reading only the tail of the file.
    pub fn last_timestamp(&self, key: &StoreKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.path(key);
        let Some(mut file) = open_if_exists(&path)? else {
            return Ok(None);
        };
        let last_line = read_last_line(&mut file, &path)?;
        if last_line.is_empty() || check_header_line(&last_line).is_ok() {
            return Ok(None);
        }
        parse_line(&last_line)
            .map(|c| Some(c.open_time))
            .map_err(|reason| corrupt(&path, "last row", reason))
    }

    /// Number of data rows (non-empty lines after the header), without parsing.
    pub fn count_rows(&self, key: &StoreKey) -> Result<usize, StoreError> {
        let path = self.path(key);
        let Some(file) = open_if_exists(&path)? else {
            return Ok(0);
        };
        let mut rows = 0usize;
        for line in BufReader::new(file).lines().skip(1) {
            let line = line.map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            if !line.trim().is_empty() {
                rows += 1;
            }
        }
        Ok(rows)
    }

    /// Replace the store with `candles` atomically.
    ///
    /// Callers pass rows already sorted and deduplicated; the previous file
    /// stays intact until the rename, so a crash leaves either version.
    pub fn write(&self, key: &StoreKey, candles: &[Candle]) -> Result<(), StoreError> {
        let path = self.path(key);
        let write_err = |reason: String| StoreError::Write {
            path: path.clone(),
            reason,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_err(format!("create dir: {e}")))?;
        }

        let tmp_path = path.with_extension("csv.tmp");
        let result = write_rows(&tmp_path, candles).and_then(|()| {
            fs::rename(&tmp_path, &path).map_err(|e| format!("atomic rename failed: {e}"))
        });

        if let Err(reason) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(write_err(reason));
        }
        if let Some(dir) = path.parent() {
            sync_dir(dir).map_err(|e| write_err(format!("fsync directory: {e}")))?;
        }
        Ok(())
    }

    /// Boundary-derived stats for a store listing.
    pub fn stat(&self, key: &StoreKey) -> Result<StoreStat, StoreError> {
        let path = self.path(key);
        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let (first, last) = match self.read_boundary(key)? {
            Boundary::Rows { first, last } => (Some(first.open_time), Some(last.open_time)),
            Boundary::Missing | Boundary::Empty => (None, None),
        };
        Ok(StoreStat {
            key: key.clone(),
            first,
            last,
            rows: self.count_rows(key)?,
            size_bytes,
        })
    }
}

fn write_rows(path: &Path, candles: &[Candle]) -> Result<(), String> {
    let file = File::create(path).map_err(|e| format!("create temp file: {e}"))?;
    let mut wtr = csv::Writer::from_writer(file);

    wtr.write_record(HEADER).map_err(|e| format!("write header: {e}"))?;
    for c in candles {
        wtr.write_record([
            format_timestamp(c.open_time),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])
        .map_err(|e| format!("write row: {e}"))?;
    }

    let mut file = wtr
        .into_inner()
        .map_err(|e| format!("flush CSV writer: {e}"))?;
    file.flush().map_err(|e| format!("flush: {e}"))?;
    file.sync_all().map_err(|e| format!("fsync: {e}"))
}

/// Persist directory entries (the rename) on platforms that allow opening a
/// directory. Elsewhere the rename is left to the filesystem.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn open_if_exists(path: &Path) -> Result<Option<File>, StoreError> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_line(reader: &mut impl BufRead, buf: &mut String, path: &Path) -> Result<usize, StoreError> {
    reader.read_line(buf).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Last non-empty line of the file, reading backwards in growing chunks.
fn read_last_line(file: &mut File, path: &Path) -> Result<String, StoreError> {
    let io_err = |source: io::Error| StoreError::Read {
        path: path.to_path_buf(),
        source,
    };
    let len = file.metadata().map_err(io_err)?.len();
    let mut chunk = TAIL_CHUNK;

    loop {
        let start = len.saturating_sub(chunk);
        file.seek(SeekFrom::Start(start)).map_err(io_err)?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.take(len - start).read_to_end(&mut buf).map_err(io_err)?;
        let text = String::from_utf8_lossy(&buf);

        let mut lines = text.lines().rev().filter(|l| !l.trim().is_empty());
        let last = lines.next();
        // The line is complete if another line precedes it in the chunk or the
        // chunk reaches the start of the file.
        let complete = start == 0 || lines.next().is_some();
        match last {
            Some(line) if complete => return Ok(line.to_string()),
            None if start == 0 => return Ok(String::new()),
            _ => chunk = chunk.saturating_mul(2),
        }
    }
}

fn corrupt(path: &Path, location: impl Into<String>, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        location: location.into(),
        reason: reason.into(),
    }
}

fn check_header(record: &csv::StringRecord) -> Result<(), String> {
    let fields: Vec<&str> = record.iter().map(str::trim).collect();
    if fields == HEADER {
        Ok(())
    } else {
        Err(format!("unexpected header {fields:?}, expected {HEADER:?}"))
    }
}

fn check_header_line(line: &str) -> Result<(), String> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if fields == HEADER {
        Ok(())
    } else {
        Err(format!("unexpected header {fields:?}, expected {HEADER:?}"))
    }
}

fn parse_line(line: &str) -> Result<Candle, String> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.trim().as_bytes());
    match rdr.records().next() {
        Some(Ok(record)) => parse_record(&record),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("empty row".to_string()),
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<Candle, String> {
    if record.len() != HEADER.len() {
        return Err(format!("expected {} fields, got {}", HEADER.len(), record.len()));
    }
    let open_time = parse_timestamp(&record[0])
        .ok_or_else(|| format!("unparseable timestamp '{}'", &record[0]))?;
    let num = |idx: usize| -> Result<f64, String> {
        record[idx]
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("{} '{}': {e}", HEADER[idx], &record[idx]))
    };
    Ok(Candle {
        open_time,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}
