//! Text normalizer
//!
//! Streams a legacy-encoded CSV payload line by line into a canonical UTF-8
//! file: decode, strip the line terminator, apply Unicode normalization,
//! re-encode, terminate with `\n`. In the CSV quoting modes each line is split
//! into fields before normalization and every field is normalized on its own. A header built from the catalog schema is
//! written first.
//!
//! Splitting happens on the raw `\n` byte before decoding, which is sound for
//! every ASCII-compatible encoding (Shift_JIS trail bytes never take the
//! value 0x0A). Configuration rejects encodings where that does not hold.

use crate::error::{Result, SyncError};
use encoding_rs::Encoding;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

/// Unicode normalization form applied to every line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizationForm {
    Nfc,
    Nfd,
    #[default]
    Nfkc,
    Nfkd,
}

impl NormalizationForm {
    pub fn apply(self, text: &str) -> String {
        match self {
            NormalizationForm::Nfc => text.nfc().collect(),
            NormalizationForm::Nfd => text.nfd().collect(),
            NormalizationForm::Nfkc => text.nfkc().collect(),
            NormalizationForm::Nfkd => text.nfkd().collect(),
        }
    }
}

impl std::str::FromStr for NormalizationForm {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NFC" => Ok(NormalizationForm::Nfc),
            "NFD" => Ok(NormalizationForm::Nfd),
            "NFKC" => Ok(NormalizationForm::Nfkc),
            "NFKD" => Ok(NormalizationForm::Nfkd),
            _ => Err(SyncError::Config(format!(
                "Unknown normalization form: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for NormalizationForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NormalizationForm::Nfc => "NFC",
            NormalizationForm::Nfd => "NFD",
            NormalizationForm::Nfkc => "NFKC",
            NormalizationForm::Nfkd => "NFKD",
        };
        f.write_str(name)
    }
}

/// How data rows are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsvQuoting {
    /// Write each normalized line exactly as the source had it
    Verbatim,
    /// RFC 4180: quote only fields that contain a delimiter, quote or newline
    Necessary,
    /// RFC 4180 and additionally quote every field that is not a number
    #[default]
    NonNumeric,
}

impl CsvQuoting {
    fn quote_style(self) -> Option<csv::QuoteStyle> {
        match self {
            CsvQuoting::Verbatim => None,
            CsvQuoting::Necessary => Some(csv::QuoteStyle::Necessary),
            CsvQuoting::NonNumeric => Some(csv::QuoteStyle::NonNumeric),
        }
    }
}

impl std::str::FromStr for CsvQuoting {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "verbatim" | "none" => Ok(CsvQuoting::Verbatim),
            "necessary" | "minimal" => Ok(CsvQuoting::Necessary),
            "non-numeric" | "nonnumeric" | "strict" => Ok(CsvQuoting::NonNumeric),
            _ => Err(SyncError::Config(format!("Unknown CSV quoting: {}", s))),
        }
    }
}

impl std::fmt::Display for CsvQuoting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CsvQuoting::Verbatim => "verbatim",
            CsvQuoting::Necessary => "necessary",
            CsvQuoting::NonNumeric => "non-numeric",
        };
        f.write_str(name)
    }
}

/// Converts one payload file into its published form
#[derive(Debug, Clone, Copy)]
pub struct TextNormalizer {
    pub source_encoding: &'static Encoding,
    pub destination_encoding: &'static Encoding,
    pub form: NormalizationForm,
    pub quoting: CsvQuoting,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self {
            source_encoding: encoding_rs::SHIFT_JIS,
            destination_encoding: encoding_rs::UTF_8,
            form: NormalizationForm::Nfkc,
            quoting: CsvQuoting::NonNumeric,
        }
    }
}

enum RowSink {
    Verbatim(BufWriter<File>),
    Csv(csv::Writer<BufWriter<File>>),
}

impl RowSink {
    fn finish(self) -> Result<()> {
        let mut file = match self {
            RowSink::Verbatim(writer) => writer,
            RowSink::Csv(writer) => writer
                .into_inner()
                .map_err(|e| SyncError::Io(e.into_error()))?,
        };
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }
}

impl TextNormalizer {
    /// Convert `source` into `destination`, returning the number of data rows.
    ///
    /// The output is staged next to `destination` and renamed into place on
    /// success; on failure the staged file is removed.
    pub fn convert(&self, header: &[String], source: &Path, destination: &Path) -> Result<u64> {
        self.convert_unless_abandoned(header, source, destination, &AtomicBool::new(false))
    }

    /// Like [`convert`](Self::convert), but once `abandoned` is set the staged
    /// output is discarded instead of renamed and `Cancelled` is returned.
    pub fn convert_unless_abandoned(
        &self,
        header: &[String],
        source: &Path,
        destination: &Path,
        abandoned: &AtomicBool,
    ) -> Result<u64> {
        info!(
            source = %source.display(),
            destination = %destination.display(),
            encoding = self.source_encoding.name(),
            form = %self.form,
            quoting = %self.quoting,
            "Converting payload"
        );

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let staging = staging_path(destination);
        match self.convert_into(header, source, &staging) {
            Ok(_) if abandoned.load(Ordering::SeqCst) => {
                let _ = std::fs::remove_file(&staging);
                Err(SyncError::Cancelled)
            },
            Ok(records) => {
                std::fs::rename(&staging, destination)?;
                debug!(records, destination = %destination.display(), "Conversion complete");
                Ok(records)
            },
            Err(e) => {
                let _ = std::fs::remove_file(&staging);
                Err(e)
            },
        }
    }

    fn convert_into(&self, header: &[String], source: &Path, destination: &Path) -> Result<u64> {
        let mut reader = BufReader::new(File::open(source)?);
        let mut file = BufWriter::new(File::create(destination)?);

        self.write_header(header, &mut file, destination)?;

        let mut sink = match self.quoting.quote_style() {
            None => RowSink::Verbatim(file),
            Some(style) => RowSink::Csv(
                csv::WriterBuilder::new()
                    .quote_style(style)
                    .terminator(csv::Terminator::Any(b'\n'))
                    .flexible(true)
                    .from_writer(file),
            ),
        };

        let mut raw = Vec::with_capacity(1024);
        let mut line = 0u64;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line += 1;
            while matches!(raw.last(), Some(b'\n' | b'\r')) {
                raw.pop();
            }

            let decoded = self
                .source_encoding
                .decode_without_bom_handling_and_without_replacement(&raw)
                .ok_or_else(|| SyncError::Encoding {
                    path: source.to_path_buf(),
                    line,
                    encoding: self.source_encoding.name(),
                })?;

            match &mut sink {
                RowSink::Verbatim(out) => {
                    let normalized = self.form.apply(&decoded);
                    out.write_all(&self.encode(&normalized, destination, line)?)?;
                    out.write_all(b"\n")?;
                },
                RowSink::Csv(out) if decoded.is_empty() => {
                    // An empty record would be written as `""`
                    out.flush()?;
                    // csv::Writer has no get_mut; flush() above drained both buffers, so write via &File
                    let mut file: &File = out.get_ref().get_ref();
                    file.write_all(b"\n")?;
                },
                RowSink::Csv(out) => {
                    // Split before normalizing: NFKC maps fullwidth quotes and commas to ASCII
                    let record = parse_line(&decoded)?;
                    let fields = record
                        .iter()
                        .map(|field| {
                            let normalized = self.form.apply(field);
                            self.encode(&normalized, destination, line).map(Cow::into_owned)
                        })
                        .collect::<Result<Vec<_>>>()?;
                    out.write_record(&fields)?;
                },
            }
        }

        sink.finish()?;
        Ok(line)
    }

    fn write_header(&self, header: &[String], out: &mut BufWriter<File>, destination: &Path) -> Result<()> {
        let fields = header
            .iter()
            .map(|name| self.encode(name, destination, 0))
            .collect::<Result<Vec<_>>>()?;
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(out);
        writer.write_record(&fields)?;
        writer.flush()?;
        Ok(())
    }

    fn encode<'a>(&self, text: &'a str, destination: &Path, line: u64) -> Result<Cow<'a, [u8]>> {
        if self.destination_encoding == encoding_rs::UTF_8 {
            return Ok(Cow::Borrowed(text.as_bytes()));
        }
        let (bytes, _, unmappable) = self.destination_encoding.encode(text);
        if unmappable {
            return Err(SyncError::Encoding {
                path: destination.to_path_buf(),
                line,
                encoding: self.destination_encoding.name(),
            });
        }
        Ok(bytes)
    }
}

/// Split one decoded line into fields, honouring the source's quoting
fn parse_line(line: &str) -> Result<csv::StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    reader.read_record(&mut record)?;
    Ok(record)
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sjis(text: &str) -> Vec<u8> {
        let (bytes, _, unmappable) = encoding_rs::SHIFT_JIS.encode(text);
        assert!(!unmappable);
        bytes.into_owned()
    }

    fn normalizer(quoting: CsvQuoting) -> TextNormalizer {
        TextNormalizer {
            quoting,
            ..TextNormalizer::default()
        }
    }

    #[test]
    fn test_halfwidth_katakana_becomes_fullwidth() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("KEN_ALL.CSV");
        let dst = dir.path().join("out/data/ken_all.csv");
        std::fs::write(&src, sjis("01101,\"060  \",\"ﾎｯｶｲﾄﾞｳ\"\r\n01102,\"002  \",\"ｻｯﾎﾟﾛｼ\"\r\n")).unwrap();

        let rows = normalizer(CsvQuoting::Verbatim)
            .convert(&header(&["code", "old_zip", "kana"]), &src, &dst)
            .unwrap();

        assert_eq!(rows, 2);
        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(
            text,
            "code,old_zip,kana\n01101,\"060  \",\"ホッカイドウ\"\n01102,\"002  \",\"サッポロシ\"\n"
        );
    }

    #[test]
    fn test_non_numeric_quoting() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, sjis("01101,060  ,\"0600000\",ﾎｯｶｲﾄﾞｳ\r\n")).unwrap();

        normalizer(CsvQuoting::NonNumeric)
            .convert(&header(&["a", "b", "c", "d"]), &src, &dst)
            .unwrap();

        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(text, "a,b,c,d\n01101,\"060  \",0600000,\"ホッカイドウ\"\n");
    }

    #[test]
    fn test_necessary_quoting_keeps_embedded_commas_quoted() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, sjis("1,\"a,b\",\"plain\"\n")).unwrap();

        normalizer(CsvQuoting::Necessary)
            .convert(&header(&["n", "pair", "word"]), &src, &dst)
            .unwrap();

        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(text, "n,pair,word\n1,\"a,b\",plain\n");
    }

    #[test]
    fn test_ascii_input_is_unchanged_except_terminators() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("ascii.csv");
        let dst = dir.path().join("ascii.out.csv");
        std::fs::write(&src, b"alpha,1\r\nbeta,2\ngamma,3").unwrap();

        for quoting in [CsvQuoting::Verbatim, CsvQuoting::Necessary] {
            let rows = normalizer(quoting)
                .convert(&header(&["name", "n"]), &src, &dst)
                .unwrap();
            assert_eq!(rows, 3);
            assert_eq!(
                std::fs::read(&dst).unwrap(),
                b"name,n\nalpha,1\nbeta,2\ngamma,3\n".to_vec()
            );
        }
    }

    #[test]
    fn test_header_comes_from_schema_not_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, b"z,y,x\n").unwrap();

        normalizer(CsvQuoting::Verbatim)
            .convert(&header(&["x", "y", "z"]), &src, &dst)
            .unwrap();

        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(text.lines().next().unwrap(), "x,y,z");
    }

    #[test]
    fn test_invalid_bytes_fail_and_leave_no_output() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.csv");
        let dst = dir.path().join("bad.out.csv");
        let mut bytes = b"ok,1\n".to_vec();
        bytes.extend_from_slice(b"\x81\x20broken\n");
        std::fs::write(&src, bytes).unwrap();

        let err = normalizer(CsvQuoting::Verbatim)
            .convert(&header(&["a", "b"]), &src, &dst)
            .unwrap_err();

        match err {
            SyncError::Encoding { line, encoding, .. } => {
                assert_eq!(line, 2);
                assert_eq!(encoding, "Shift_JIS");
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dst.exists());
        assert!(!staging_path(&dst).exists());
    }

    #[test]
    fn test_abandoned_conversion_is_not_renamed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, b"1,x\n").unwrap();

        let err = TextNormalizer::default()
            .convert_unless_abandoned(&header(&["n", "s"]), &src, &dst, &AtomicBool::new(true))
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(!dst.exists());
        assert!(!staging_path(&dst).exists());
    }

    #[test]
    fn test_empty_source_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("empty.csv");
        let dst = dir.path().join("empty.out.csv");
        std::fs::write(&src, b"").unwrap();

        let rows = TextNormalizer::default()
            .convert(&header(&["a"]), &src, &dst)
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "a\n");
    }

    #[test]
    fn test_fullwidth_quote_stays_inside_its_field() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, sjis("1,\"Ａ＂Ｂ\"\r\n")).unwrap();

        TextNormalizer::default()
            .convert(&header(&["a", "b"]), &src, &dst)
            .unwrap();

        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(text, "a,b\n1,\"A\"\"B\"\n");
    }

    #[test]
    fn test_fullwidth_comma_does_not_split_field() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, sjis("1,Ａ，Ｂ\r\n")).unwrap();

        TextNormalizer::default()
            .convert(&header(&["a", "b"]), &src, &dst)
            .unwrap();

        let text = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(text, "a,b\n1,\"A,B\"\n");
        let mut rows = csv::Reader::from_path(&dst).unwrap();
        for row in rows.records() {
            assert_eq!(row.unwrap().len(), 2);
        }
    }

    #[test]
    fn test_blank_line_stays_blank() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, b"1,x\n\n2,y\n").unwrap();

        for quoting in [CsvQuoting::Verbatim, CsvQuoting::Necessary, CsvQuoting::NonNumeric] {
            let rows = normalizer(quoting)
                .convert(&header(&["n", "s"]), &src, &dst)
                .unwrap();
            assert_eq!(rows, 3);
            let expected = match quoting {
                CsvQuoting::NonNumeric => "n,s\n1,\"x\"\n\n2,\"y\"\n",
                _ => "n,s\n1,x\n\n2,y\n",
            };
            assert_eq!(std::fs::read_to_string(&dst).unwrap(), expected, "{quoting}");
        }
    }

    #[test]
    fn test_parse_options() {
        assert_eq!("nfkc".parse::<NormalizationForm>().unwrap(), NormalizationForm::Nfkc);
        assert_eq!("NFD".parse::<NormalizationForm>().unwrap(), NormalizationForm::Nfd);
        assert!("nfx".parse::<NormalizationForm>().is_err());
        assert_eq!("non_numeric".parse::<CsvQuoting>().unwrap(), CsvQuoting::NonNumeric);
        assert_eq!("verbatim".parse::<CsvQuoting>().unwrap(), CsvQuoting::Verbatim);
        assert!("loose".parse::<CsvQuoting>().is_err());
    }
}
