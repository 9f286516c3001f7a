use std::error::Error;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use harvest_crawler::{Checkpoint, KnownKeys, PersistenceError, Record, WriteMode};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CsvWriterConfig {
    #[serde(default = "default_csv_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub escape: Option<char>,
    #[serde(default)]
    pub flexible: bool,
    #[serde(default = "default_csv_terminator")]
    pub terminator: CsvTerminator,
}

impl Default for CsvWriterConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            escape: None,
            flexible: false,
            terminator: CsvTerminator::Any('\n'),
        }
    }
}

fn default_csv_delimiter() -> char {
    CsvWriterConfig::default().delimiter
}

fn default_csv_terminator() -> CsvTerminator {
    CsvWriterConfig::default().terminator
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum CsvTerminator {
    CRLF,
    Any(char),
}

impl From<CsvTerminator> for csv::Terminator {
    fn from(source: CsvTerminator) -> Self {
        match source {
            CsvTerminator::CRLF => Self::CRLF,
            CsvTerminator::Any(c) => Self::Any(c as u8),
        }
    }
}

impl From<&CsvWriterConfig> for csv::WriterBuilder {
    fn from(c: &CsvWriterConfig) -> Self {
        let mut builder = csv::WriterBuilder::new();
        builder.delimiter(c.delimiter as u8);
        builder.terminator(c.terminator.into());
        builder.flexible(c.flexible);
        if let Some(escape) = c.escape {
            builder.double_quote(false);
            builder.escape(escape as u8);
        } else {
            builder.double_quote(true);
        }
        builder
    }
}

/// Reads back what the matching writer produced.
impl From<&CsvWriterConfig> for csv::ReaderBuilder {
    fn from(c: &CsvWriterConfig) -> Self {
        let mut builder = csv::ReaderBuilder::new();
        builder.delimiter(c.delimiter as u8);
        builder.terminator(c.terminator.into());
        builder.flexible(c.flexible);
        if let Some(escape) = c.escape {
            builder.double_quote(false);
            builder.escape(Some(escape as u8));
        } else {
            builder.double_quote(true);
        }
        builder
    }
}

/// CSV file checkpoint.
///
/// Creating writes a temporary file next to the target then moves it over
/// the target. Appending writes all rows of a call at once under the schema
/// the file was created with.
pub struct CsvCheckpoint {
    path: PathBuf,
    base_columns: Vec<String>,
    sentinel: String,
    config: CsvWriterConfig,
    schema: Option<Vec<String>>,
}

impl CsvCheckpoint {
    pub fn new(
        path: impl Into<PathBuf>,
        base_columns: Vec<String>,
        sentinel: impl Into<String>,
        config: CsvWriterConfig,
    ) -> Self {
        Self {
            path: path.into(),
            base_columns,
            sentinel: sentinel.into(),
            config,
            schema: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base columns then the dynamic keys they don't already cover, sorted.
    pub fn schema_for(&self, keys: &KnownKeys) -> Vec<String> {
        let mut schema = self.base_columns.clone();
        for key in keys.snapshot() {
            if !schema.contains(&key) {
                schema.push(key);
            }
        }
        schema
    }

    fn create(&mut self, records: &[Record], keys: &KnownKeys) -> Result<(), BoxError> {
        let schema = self.schema_for(keys);
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs_err::create_dir_all(dir)?;

        let tmp = NamedTempFile::new_in(dir)?;
        let mut wtr = csv::WriterBuilder::from(&self.config).from_writer(tmp);
        wtr.write_record(&schema)?;
        for record in records {
            wtr.write_record(self.row(record, &schema))?;
        }
        let tmp = wtr.into_inner().map_err(|e| e.into_error())?;
        tmp.persist(&self.path)?;

        log::debug!(
            "Created {} with {} column(s), {} row(s)",
            self.path.display(),
            schema.len(),
            records.len()
        );
        self.schema = Some(schema);
        Ok(())
    }

    fn append(&mut self, records: &[Record], keys: &KnownKeys) -> Result<(), BoxError> {
        let schema = if self.path.exists() {
            self.schema.clone().or_else(|| self.existing_schema())
        } else {
            None
        };
        let Some(schema) = schema else {
            log::warn!(
                "Can't append to {}, writing it from scratch",
                self.path.display()
            );
            return self.create(records, keys);
        };

        let mut builder = csv::WriterBuilder::from(&self.config);
        builder.has_headers(false);
        let mut wtr = builder.from_writer(vec![]);
        for record in records {
            wtr.write_record(self.row(record, &schema))?;
        }
        let buf = wtr.into_inner().map_err(|e| e.into_error())?;

        let mut file = fs_err::OpenOptions::new().append(true).open(&self.path)?;
        append_whole(&mut file, &buf)?;

        self.schema = Some(schema);
        Ok(())
    }

    /// Header of the target when it looks like one of ours.
    fn existing_schema(&self) -> Option<Vec<String>> {
        let mut rdr = csv::ReaderBuilder::from(&self.config)
            .from_path(&self.path)
            .ok()?;
        let schema = rdr
            .headers()
            .ok()?
            .iter()
            .map(String::from)
            .collect::<Vec<_>>();
        (schema.first().map(String::as_str) == Some("url")).then_some(schema)
    }

    fn row<'r>(&'r self, record: &'r Record, schema: &'r [String]) -> Vec<&'r str> {
        schema
            .iter()
            .map(|column| record.get(column).unwrap_or(&self.sentinel))
            .collect()
    }
}

/// A sink that can be cut back to an earlier length.
trait Truncate: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for fs_err::File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes `buf` at the end of `sink`. On failure whatever part of `buf` made
/// it out is cut off again, so a retry never duplicates rows.
fn append_whole<T: Truncate>(sink: &mut T, buf: &[u8]) -> io::Result<()> {
    let len = sink.seek(SeekFrom::End(0))?;
    let res = sink.write_all(buf).and_then(|()| sink.flush());
    if let Err(e) = res {
        if let Err(cut) = sink.truncate(len) {
            log::error!("Couldn't cut a partial batch back to {len} byte(s): {cut}");
        }
        return Err(e);
    }
    Ok(())
}

impl Checkpoint for CsvCheckpoint {
    fn persist(
        &mut self,
        records: &[Record],
        keys: &KnownKeys,
        mode: WriteMode,
    ) -> Result<(), PersistenceError> {
        let res = match mode {
            WriteMode::Create => self.create(records, keys),
            WriteMode::Append => self.append(records, keys),
        };
        res.map_err(|source| PersistenceError {
            target: self.path.display().to_string(),
            count: records.len(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// An in-memory file with room for `room` more bytes.
    struct SmallDisk {
        data: Cursor<Vec<u8>>,
        room: usize,
    }

    impl Write for SmallDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.room).min(4);
            self.room -= n;
            self.data.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for SmallDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl Truncate for SmallDisk {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.get_mut().truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_rows() {
        let mut disk = SmallDisk {
            data: Cursor::new(b"url,name\n".to_vec()),
            room: 10,
        };

        let err = append_whole(&mut disk, b"https://shop.test/p/1,Item 1\n").unwrap_err();
        assert_eq!(err.to_string(), "no space left on device");
        assert_eq!(disk.data.get_ref().as_slice(), b"url,name\n");

        disk.room = 100;
        append_whole(&mut disk, b"https://shop.test/p/1,Item 1\n").unwrap();
        assert_eq!(
            disk.data.get_ref().as_slice(),
            b"url,name\nhttps://shop.test/p/1,Item 1\n"
        );
    }

    #[test]
    fn append_goes_to_the_end_of_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs_err::write(&path, "url\n").unwrap();

        let mut file = fs_err::OpenOptions::new().append(true).open(&path).unwrap();
        append_whole(&mut file, b"https://shop.test/p/1\n").unwrap();

        assert_eq!(
            fs_err::read_to_string(&path).unwrap(),
            "url\nhttps://shop.test/p/1\n"
        );
    }
}
