//! Whole-file reads and crash-consistent writes.  Object libraries travel through consensus and
//! land on disk here; a torn library would be reloaded at restore time, so writes go through a
//! temporary sibling, fsync, and rename.

use std::fs::File;
use std::io::{Read, Write};

use utf8path::Path;

use replicant_pb::Error;

pub fn atomic_read(path: &Path) -> Result<Vec<u8>, Error> {
    let mut contents = Vec::new();
    let mut f = File::open(path.as_str())?;
    f.read_to_end(&mut contents)?;
    Ok(contents)
}

pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), Error> {
    let dir = path.dirname();
    let tmp = dir.join(".atomic.tmp");
    let mut f = File::create(tmp.as_str())?;
    f.write_all(contents)?;
    f.sync_all()?;
    fsync_dir(&dir)?;
    std::fs::rename(tmp.as_str(), path.as_str())?;
    fsync_dir(&dir)?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), Error> {
    File::open(dir.as_str())?.sync_all()?;
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> Path<'static> {
        let dir = std::env::temp_dir().join(format!("replicant.{}.{}", name, std::process::id()));
        _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Path::from(dir.to_str().unwrap().to_string())
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = scratch_dir("atomic1");
        let path = dir.join("library.so");
        atomic_write(&path, b"contents").unwrap();
        assert_eq!(b"contents".to_vec(), atomic_read(&path).unwrap());
    }

    #[test]
    fn write_replaces_existing_content() {
        let dir = scratch_dir("atomic2");
        let path = dir.join("library.so");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(b"second".to_vec(), atomic_read(&path).unwrap());
    }

    #[test]
    fn read_of_missing_file_errors() {
        let dir = scratch_dir("atomic3");
        assert!(atomic_read(&dir.join("missing")).is_err());
    }
}
