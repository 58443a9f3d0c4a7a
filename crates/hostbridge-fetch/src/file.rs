use crate::{ArchiveSource, FetchError, SourceStream};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

/// `file://` archive source. Offsets past the end of the file restart from zero.
pub struct FileSource;

fn reference_path(reference: &str) -> Result<PathBuf, FetchError> {
    reference
        .strip_prefix("file://")
        .map(PathBuf::from)
        .ok_or_else(|| FetchError::UnsupportedScheme(reference.to_owned()))
}

impl ArchiveSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError> {
        let path = reference_path(reference)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(FetchError::Network(format!("{}: {e}", path.display()))),
        };
        let len = file.metadata()?.len();
        let resumed = offset > 0 && offset < len;
        if resumed {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(SourceStream {
            reader: Box::new(file),
            total_len: Some(len),
            resumed,
        })
    }
}
