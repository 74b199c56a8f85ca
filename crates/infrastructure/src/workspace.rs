//! 工作区文件清单
//!
//! 主节点按目录生成清单供工作节点比对，工作节点用同样的方式生成本地清单。

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{FileEntry, FileListing};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// 将相对路径解析到 `root` 之下，拒绝绝对路径和 `..`
pub fn resolve_within(root: &Path, relative: &str) -> ClusterResult<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ClusterError::InvalidState(format!(
                    "path escapes workspace: {relative}"
                )))
            }
        }
    }
    Ok(resolved)
}

/// 递归生成目录清单，目录不存在时返回空清单
pub fn scan_dir(root: &Path) -> ClusterResult<FileListing> {
    let mut listing = FileListing::new();
    if !root.is_dir() {
        return Ok(listing);
    }

    for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| ClusterError::Io(std::io::Error::other(e.to_string())))?;
        let metadata = entry.metadata().map_err(|e| {
            ClusterError::Io(std::io::Error::other(format!(
                "{}: {}",
                entry.path().display(),
                e
            )))
        })?;
        if metadata.file_type().is_symlink() {
            continue;
        }

        let relative = relative_path(root, entry.path())?;
        let is_dir = metadata.is_dir();
        let hash = if is_dir {
            String::new()
        } else {
            hash_file(entry.path())?
        };
        let mod_time: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        listing.insert(
            relative.clone(),
            FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: relative,
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
                mod_time,
                mode: file_mode(&metadata),
                hash,
            },
        );
    }
    Ok(listing)
}

/// 文件内容的 SHA-256 十六进制摘要
pub fn hash_file(path: &Path) -> ClusterResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn relative_path(root: &Path, path: &Path) -> ClusterResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| ClusterError::Internal(e.to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg/inner")).unwrap();
        std::fs::write(dir.path().join("main.py"), b"print('hi')").unwrap();
        std::fs::write(dir.path().join("pkg/inner/a.txt"), b"abc").unwrap();

        let listing = scan_dir(dir.path()).unwrap();
        let keys: Vec<&str> = listing.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["main.py", "pkg", "pkg/inner", "pkg/inner/a.txt"]);

        let file = &listing["pkg/inner/a.txt"];
        assert!(!file.is_dir);
        assert_eq!(file.size, 3);
        assert_eq!(file.name, "a.txt");
        assert_eq!(
            file.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(listing["pkg"].is_dir);
        assert!(listing["pkg"].hash.is_empty());
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_dir(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_within_rejects_escape() {
        let root = Path::new("/srv/workspace");
        assert_eq!(
            resolve_within(root, "12/main.py").unwrap(),
            PathBuf::from("/srv/workspace/12/main.py")
        );
        assert_eq!(
            resolve_within(root, "/12/./a").unwrap(),
            PathBuf::from("/srv/workspace/12/a")
        );
        assert!(resolve_within(root, "../etc/passwd").is_err());
        assert!(resolve_within(root, "12/../../x").is_err());
    }
}
