use crate::FileNum;
use std::{fs::File, io::Write, path::Path};

pub const MANIFEST_FILE: &str = "MANIFEST";

/// Formats a file number the way it appears in file names and diagnostics
#[must_use]
pub fn fmt_file_num(file_num: FileNum) -> String {
    format!("{file_num:06}")
}

/// Name of a sorted table file
#[must_use]
pub fn table_file_name(file_num: FileNum) -> String {
    format!("{}.sst", fmt_file_num(file_num))
}

/// Atomically rewrites a file
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("should have parent folder");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use test_log::test;

    #[test]
    fn test_atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        {
            let mut file = File::create(&path)?;
            write!(file, "asdasdasdasdasd")?;
        }

        rewrite_atomic(&path, b"newcontent")?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!("newcontent", content);

        Ok(())
    }

    #[test]
    fn test_file_names() {
        assert_eq!("000007", fmt_file_num(7));
        assert_eq!("000123.sst", table_file_name(123));
    }
}
