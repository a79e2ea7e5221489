//! JSON-lines files rewritten atomically: the full content goes to `<file>.tmp`,
//! is fsynced, then renamed over `<file>`. A crash leaves either the old or the
//! new file, never a partial one.

use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

use crate::shared::errors::OutboxError;

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutboxError + '_ {
    move |source| OutboxError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Reads every parsable line of `path`. A missing file reads as empty;
/// lines that fail to parse are skipped with a warning.
pub async fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, OutboxError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path)(e)),
    };

    let mut items = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) => log::warn!("{}:{}: skipping unreadable line: {}", path.display(), n + 1, e),
        }
    }
    Ok(items)
}

pub async fn rewrite<'a, T, I>(path: &Path, items: I) -> Result<(), OutboxError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut text = String::new();
    for item in items {
        text.push_str(&serde_json::to_string(item)?);
        text.push('\n');
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }

    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
    file.write_all(text.as_bytes()).await.map_err(io_error(&tmp))?;
    file.sync_all().await.map_err(io_error(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        n: u32,
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<Line> = load(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_creates_parents_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/q.jsonl");

        rewrite(&path, &[Line { n: 1 }, Line { n: 2 }]).await.unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());

        let items: Vec<Line> = load(&path).await.unwrap();
        assert_eq!(items, vec![Line { n: 1 }, Line { n: 2 }]);
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        std::fs::write(&path, "{\"n\":1}\nnot json\n\n{\"n\":3}").unwrap();

        let items: Vec<Line> = load(&path).await.unwrap();
        assert_eq!(items, vec![Line { n: 1 }, Line { n: 3 }]);
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/data/queue.jsonl")),
            PathBuf::from("/data/queue.jsonl.tmp")
        );
    }
}
