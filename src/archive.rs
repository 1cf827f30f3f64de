//! Archive codec (spec.md §4.7 / SPEC_FULL.md §4.7): pack a set of series
//! directories into a single uncompressed tar, and unpack one back out.
//! Entries are named by the top-level series-directory basename (DESIGN
//! NOTES §9: archive format drift in the source is resolved to tar-only,
//! flat top-level entries — no `zip` support).

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ArchiveError;

/// Packs `directories` into a single tar file at `destination`. Each
/// directory is added as a top-level entry named by its own basename,
/// recursively including its contents.
pub async fn pack(directories: &[Utf8PathBuf], destination: &Utf8Path) -> Result<(), ArchiveError> {
    let directories = directories.to_vec();
    let destination = destination.to_owned();
    tokio::task::spawn_blocking(move || pack_blocking(&directories, &destination))
        .await
        .expect("pack task should not panic")
}

fn pack_blocking(directories: &[Utf8PathBuf], destination: &Utf8Path) -> Result<(), ArchiveError> {
    if let Some(parent) = destination.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let file = fs_err::File::create(destination)?;
    let mut builder = tar::Builder::new(file);
    for directory in directories {
        let entry_name = directory.file_name().unwrap_or(directory.as_str());
        builder.append_dir_all(entry_name, directory)?;
    }
    builder.finish()?;
    Ok(())
}

/// Unpacks the tar at `archive_path` into `destination`, creating it if
/// necessary. Returns the top-level entry names found (the series-directory
/// basenames), so the caller can locate them under `destination`.
pub async fn unpack(archive_path: &Utf8Path, destination: &Utf8Path) -> Result<Vec<String>, ArchiveError> {
    let archive_path = archive_path.to_owned();
    let destination = destination.to_owned();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive_path, &destination))
        .await
        .expect("unpack task should not panic")
}

fn unpack_blocking(archive_path: &Utf8Path, destination: &Utf8Path) -> Result<Vec<String>, ArchiveError> {
    fs_err::create_dir_all(destination)?;
    let file = fs_err::File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    let mut top_level = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if let Some(first_component) = path.components().next() {
            let name = first_component.as_os_str().to_string_lossy().into_owned();
            if !top_level.contains(&name) {
                top_level.push(name);
            }
        }
        entry.unpack_in(destination)?;
    }
    Ok(top_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pack_then_unpack_restores_files() {
        let src = tempfile::tempdir().unwrap();
        let series_dir = src.path().join("1.2.3.4");
        std::fs::create_dir_all(&series_dir).unwrap();
        std::fs::write(series_dir.join("1.dcm"), b"abc").unwrap();
        std::fs::write(series_dir.join("2.dcm"), b"defg").unwrap();

        let archive_path = Utf8PathBuf::from_path_buf(src.path().join("input.tar")).unwrap();
        let series_dir = Utf8PathBuf::from_path_buf(series_dir).unwrap();
        pack(&[series_dir.clone()], &archive_path).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let dest_path = Utf8PathBuf::from_path_buf(dest.path().to_path_buf()).unwrap();
        let top_level = unpack(&archive_path, &dest_path).await.unwrap();

        assert_eq!(top_level, vec!["1.2.3.4".to_string()]);
        assert_eq!(fs_err::read(dest_path.join("1.2.3.4/1.dcm")).unwrap(), b"abc");
        assert_eq!(fs_err::read(dest_path.join("1.2.3.4/2.dcm")).unwrap(), b"defg");
    }

    #[tokio::test]
    async fn test_pack_multiple_series_are_independent_top_level_entries() {
        let src = tempfile::tempdir().unwrap();
        for name in ["series-a", "series-b"] {
            let dir = src.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("f.dcm"), name.as_bytes()).unwrap();
        }
        let archive_path = Utf8PathBuf::from_path_buf(src.path().join("input.tar")).unwrap();
        let dirs = vec![
            Utf8PathBuf::from_path_buf(src.path().join("series-a")).unwrap(),
            Utf8PathBuf::from_path_buf(src.path().join("series-b")).unwrap(),
        ];
        pack(&dirs, &archive_path).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        let dest_path = Utf8PathBuf::from_path_buf(dest.path().to_path_buf()).unwrap();
        let mut top_level = unpack(&archive_path, &dest_path).await.unwrap();
        top_level.sort();
        assert_eq!(top_level, vec!["series-a".to_string(), "series-b".to_string()]);
    }
}
