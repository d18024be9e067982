use flate2::read::MultiGzDecoder;
use log::debug;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The two leading bytes of every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Buffer size used for corpus readers. Annotation files are read strictly
/// sequentially, so a large buffer amortizes syscalls without other cost.
const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Opens a text input for sequential reading.
///
/// Gzip-compressed files (as distributed by the GO consortium, e.g.
/// `goa_human.gaf.gz`) are detected from their magic bytes rather than the
/// file extension, and decoded transparently. Multi-member archives are
/// supported.
pub fn open_text(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let read = read_prefix(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read == magic.len() && magic == GZIP_MAGIC {
        debug!("Reading '{}' as gzip-compressed text", path.display());
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiGzDecoder::new(file),
        )))
    } else {
        debug!("Reading '{}' as plain text", path.display());
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)))
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Resolves `file_name` inside `dir`, creating the directory if needed.
pub fn output_path(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    Ok(dir.join(file_name))
}
