//! Advertises the listening port to the client: write-tmp-then-rename so a
//! concurrent reader never observes a partial file.

use std::io::Write as _;

use camino::Utf8Path;

#[derive(Debug, thiserror::Error)]
pub enum PortFileError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const EOF_MARKER: &str = "EOF";

pub fn write(path: &Utf8Path, port: u16) -> Result<(), PortFileError> {
    let tmp_path = path.with_extension("tmp");

    let write_and_sync = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        write!(file, "sock={port}\n{EOF_MARKER}")?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    };

    write_and_sync().map_err(|source| PortFileError::Write {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_port_and_eof_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("port_file.txt");

        write(&path, 12345).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "sock=12345\nEOF");
    }

    #[test]
    fn leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("port_file.txt");

        write(&path, 1).unwrap();

        assert!(!path.with_extension("tmp").exists());
    }
}
