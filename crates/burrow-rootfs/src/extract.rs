//! Tar extraction with transparent decompression.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;

use crate::detect::{Compression, SNIFF_LEN};
use crate::error::RootfsError;

/// Unpack `archive` into `dest`, which must already exist and be empty.
///
/// Compression is sniffed from the archive's leading bytes. Entry
/// permissions are preserved; ownership is only applied when running as
/// root, since chown fails for unprivileged users. Entries with absolute or
/// parent-relative paths abort the extraction.
///
/// Blocking; callers on the async runtime wrap this in `spawn_blocking`.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), RootfsError> {
    let mut file = fs::File::open(archive)
        .map_err(|_| RootfsError::ArchiveNotFound(archive.to_path_buf()))?;

    let mut header = vec![0u8; SNIFF_LEN];
    let read = read_up_to(&mut file, &mut header)?;
    header.truncate(read);
    let compression = Compression::sniff(&header)
        .ok_or_else(|| RootfsError::UnknownFormat(archive.to_path_buf()))?;
    file.seek(SeekFrom::Start(0))?;

    debug!(
        "unpacking {} ({compression:?}) into {}",
        archive.display(),
        dest.display()
    );

    let reader: Box<dyn Read> = match compression {
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compression::None => Box::new(file),
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    // SAFETY: geteuid has no failure modes.
    tar.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry.path()?.into_owned();
        if path.is_absolute()
            || path
                .components()
                .any(|part| matches!(part, Component::ParentDir))
        {
            return Err(RootfsError::UnsafeEntry(path.display().to_string()));
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
