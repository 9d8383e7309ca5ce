//! Zip packaging helpers used by the node (to produce `archive.zip`/`output.zip`)
//! and the controller (to unpack them into a run's artifact directories).
//!
//! Grounded on `examples/original_source/tubular_node/node.py`
//! (`compressArchive`/`compressOutputFile`).
//!
//! `file_utils.py` compresses with `zipfile.ZIP_LZMA`; the `zip` crate can only
//! write Stored/Deflated/Bzip2/Zstd entries (LZMA is read-only support), so these
//! helpers write Deflated instead. Both producer (node) and consumer (controller)
//! go through this same module, so the substitution does not affect
//! interoperability.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Zips every file under `src_dir` into `dest_zip`, storing paths relative to
/// `src_dir` in a deterministic (sorted) order.
pub fn zip_directory(src_dir: &Path, dest_zip: &Path) -> io::Result<()> {
    let mut entries: Vec<_> = walkdir::WalkDir::new(src_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    let file = File::create(dest_zip)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .expect("entry is under src_dir")
            .to_string_lossy()
            .replace('\\', "/");
        writer
            .start_file(rel, options)
            .map_err(to_io_error)?;
        let mut f = File::open(entry.path())?;
        io::copy(&mut f, &mut writer)?;
    }

    writer.finish().map_err(to_io_error)?;
    Ok(())
}

/// Zips the single file `src_file` into `dest_zip`, storing it under its own file
/// name.
pub fn zip_file(src_file: &Path, dest_zip: &Path) -> io::Result<()> {
    let name = src_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());

    let file = File::create(dest_zip)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(name, options).map_err(to_io_error)?;
    let mut f = File::open(src_file)?;
    io::copy(&mut f, &mut writer)?;
    writer.finish().map_err(to_io_error)?;
    Ok(())
}

/// Decompresses `src_zip` into `dest_dir`, creating parent directories as needed.
pub fn unzip(src_zip: &Path, dest_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dest_dir)?;
    let file = File::open(src_zip)?;
    let mut archive = ZipArchive::new(file).map_err(to_io_error)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(to_io_error)?;
        let out_path = match entry.enclosed_name() {
            Some(p) => dest_dir.join(p),
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        out_file.write_all(&buf)?;
    }

    Ok(())
}

fn to_io_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "A").unwrap();
        fs::write(src.join("nested/b.txt"), "B").unwrap();

        let zip_path = dir.path().join("out.zip");
        zip_directory(&src, &zip_path).unwrap();

        let dest = dir.path().join("dest");
        unzip(&zip_path, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "A");
        assert_eq!(fs::read_to_string(dest.join("nested/b.txt")).unwrap(), "B");
    }

    #[test]
    fn zips_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let src_file = dir.path().join("task.output");
        fs::write(&src_file, "log line\n").unwrap();

        let zip_path = dir.path().join("output.zip");
        zip_file(&src_file, &zip_path).unwrap();

        let dest = dir.path().join("dest");
        unzip(&zip_path, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("task.output")).unwrap(), "log line\n");
    }
}
