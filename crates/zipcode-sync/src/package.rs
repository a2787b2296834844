//! Data package archive
//!
//! Layout of `datapackage.zip`:
//!
//! ```text
//! datapackage.json
//! data/<file name>   (one per synchronized resource)
//! ```

use crate::error::Result;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const PACKAGE_FILE_NAME: &str = "datapackage.zip";
pub const CATALOG_ENTRY_NAME: &str = "datapackage.json";
pub const DATA_ENTRY_PREFIX: &str = "data/";

/// Bundle the catalog and data files into `destination`.
///
/// `data_files` pairs each entry name (the bare file name) with its path on
/// disk. The archive is staged and renamed, like every other output.
pub fn build_package(catalog: &Path, data_files: &[(String, &Path)], destination: &Path) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let staging = destination.with_extension("zip.partial");
    let result = write_archive(catalog, data_files, &staging);
    match result {
        Ok(()) => {
            std::fs::rename(&staging, destination)?;
            let size = std::fs::metadata(destination)?.len();
            info!(
                path = %destination.display(),
                files = data_files.len() + 1,
                bytes = size,
                "Created data package"
            );
            Ok(size)
        },
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            Err(e)
        },
    }
}

fn write_archive(catalog: &Path, data_files: &[(String, &Path)], staging: &Path) -> Result<()> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(false);
    let mut zip = ZipWriter::new(BufWriter::new(File::create(staging)?));

    zip.start_file(CATALOG_ENTRY_NAME, options)?;
    std::io::copy(&mut BufReader::new(File::open(catalog)?), &mut zip)?;

    for (name, path) in data_files {
        zip.start_file(format!("{}{}", DATA_ENTRY_PREFIX, name), options)?;
        std::io::copy(&mut BufReader::new(File::open(path)?), &mut zip)?;
    }

    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(())
}
