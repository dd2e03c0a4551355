//! Ramdisk unpacking: gzip-compressed `newc` cpio archives.

use std::fs::{self, File, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

const HEADER_LEN: usize = 110;
const FIELD_LEN: usize = 8;
const TRAILER: &str = "TRAILER!!!";

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, thiserror::Error)]
pub enum RamdiskError {
    #[error("failed to read ramdisk: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported cpio magic {0:?}")]
    BadMagic(String),

    #[error("malformed cpio header field {0}")]
    BadHeader(&'static str),

    #[error("archive entry {0} escapes the target directory")]
    UnsafePath(String),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Header fields of a `newc` entry that extraction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    mode: u32,
    file_size: u32,
    name_size: u32,
}

impl Header {
    fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, RamdiskError> {
        let magic = raw.get(..6).unwrap_or_default();
        if magic != b"070701" && magic != b"070702" {
            return Err(RamdiskError::BadMagic(
                String::from_utf8_lossy(magic).into_owned(),
            ));
        }
        // Fields after the magic: ino, mode, uid, gid, nlink, mtime,
        // filesize, devmajor, devminor, rdevmajor, rdevminor, namesize, check.
        let field = |index: usize, name: &'static str| -> Result<u32, RamdiskError> {
            let start = 6 + index * FIELD_LEN;
            raw.get(start..start + FIELD_LEN)
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| u32::from_str_radix(s, 16).ok())
                .ok_or(RamdiskError::BadHeader(name))
        };
        Ok(Self {
            mode: field(1, "mode")?,
            file_size: field(6, "filesize")?,
            name_size: field(11, "namesize")?,
        })
    }
}

/// Tracks the stream offset for the archive's 4-byte alignment.
struct CpioStream<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CpioStream<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn align(&mut self) -> io::Result<()> {
        let pad = (4 - self.offset % 4) % 4;
        let mut sink = [0u8; 3];
        let pad_buf = sink.get_mut(..pad as usize).unwrap_or_default();
        self.read_exact(pad_buf)
    }
}

/// Resolves an archive name inside `target`, rejecting anything that could
/// land outside it. Returns `None` for the archive root itself.
fn entry_path(target: &Path, name: &str) -> Result<Option<PathBuf>, RamdiskError> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(RamdiskError::UnsafePath(name.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(target.join(relative)))
}

fn write_err(path: &Path) -> impl FnOnce(io::Error) -> RamdiskError + '_ {
    move |source| RamdiskError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), RamdiskError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(write_err(parent)),
        None => Ok(()),
    }
}

/// Extracts a `newc` cpio stream into `target`. Directories, regular files
/// and symlinks are created; other node types are skipped. Returns the
/// number of entries written.
pub fn unpack_cpio(reader: impl Read, target: &Path) -> Result<usize, RamdiskError> {
    let mut stream = CpioStream {
        inner: reader,
        offset: 0,
    };
    let mut written = 0;

    loop {
        let mut raw = [0u8; HEADER_LEN];
        stream.read_exact(&mut raw)?;
        let header = Header::parse(&raw)?;

        let name_bytes = stream.read_vec(header.name_size as usize)?;
        stream.align()?;
        let name = String::from_utf8_lossy(&name_bytes)
            .trim_end_matches('\0')
            .to_string();
        if name == TRAILER {
            break;
        }

        let data = stream.read_vec(header.file_size as usize)?;
        stream.align()?;

        let Some(path) = entry_path(target, &name)? else {
            continue;
        };
        let perm = Permissions::from_mode(header.mode & 0o7777);

        match header.mode & S_IFMT {
            S_IFDIR => {
                fs::create_dir_all(&path).map_err(write_err(&path))?;
                fs::set_permissions(&path, perm).map_err(write_err(&path))?;
            }
            S_IFREG => {
                ensure_parent(&path)?;
                fs::write(&path, &data).map_err(write_err(&path))?;
                fs::set_permissions(&path, perm).map_err(write_err(&path))?;
            }
            S_IFLNK => {
                ensure_parent(&path)?;
                let link_target = String::from_utf8_lossy(&data).into_owned();
                if fs::symlink_metadata(&path).is_ok() {
                    fs::remove_file(&path).map_err(write_err(&path))?;
                }
                std::os::unix::fs::symlink(&link_target, &path).map_err(write_err(&path))?;
            }
            other => {
                debug!(entry = %name, mode = format_args!("{other:o}"), "skipping special file");
                continue;
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Unpacks the gzip-compressed cpio image at `image` into `target`.
pub fn unpack_ramdisk(image: &Path, target: &Path) -> Result<usize, RamdiskError> {
    let file = File::open(image)?;
    unpack_cpio(GzDecoder::new(BufReader::new(file)), target)
}
