use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Set the permission bits of `path` to `mode`.
pub async fn grant_execute(path: &Path, mode: u32) -> anyhow::Result<()> {
    // Only the lower 12 bits are valid permission bits
    let mode_bits = mode & 0o7777;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let perms = std::fs::Permissions::from_mode(mode_bits);
        std::fs::set_permissions(&target, perms)
            .map_err(|e| anyhow::anyhow!("chmod {:o} {} failed: {}", mode_bits, target.display(), e))
    })
    .await??;
    Ok(())
}

pub async fn read_text(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))
}

/// Read `KEY=VALUE` pairs from an env file. A missing file yields no pairs.
pub async fn load_env_file(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse_env(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => anyhow::bail!("Failed to read env file {}: {}", path.display(), e),
    }
}

fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_execute_sets_mode() {
        let file = tempfile::NamedTempFile::new().unwrap();
        grant_execute(file.path(), 0o755).await.unwrap();

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_grant_execute_masks_high_bits() {
        let file = tempfile::NamedTempFile::new().unwrap();
        grant_execute(file.path(), 0o170_700).await.unwrap();

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o700);
    }

    #[tokio::test]
    async fn test_grant_execute_missing_file() {
        let result = grant_execute(Path::new("/nonexistent/start.sh"), 0o777).await;
        assert!(result.is_err(), "chmod on a missing path should fail");
    }

    #[tokio::test]
    async fn test_read_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub.txt");
        std::fs::write(&path, "line one\nline two\n").unwrap();

        let content = read_text(&path).await.unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_read_text_missing() {
        let result = read_text(Path::new("/nonexistent/sub.txt")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_text_rejects_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();

        assert!(read_text(&path).await.is_err());
    }

    #[test]
    fn test_parse_env() {
        let content = "\n# comment\nPORT=3000\n  NAME = node \nURL=http://x/?a=b\nnoequals\n=orphan\n";
        let pairs = parse_env(content);
        assert_eq!(
            pairs,
            vec![
                ("PORT".to_string(), "3000".to_string()),
                ("NAME".to_string(), " node".to_string()),
                ("URL".to_string(), "http://x/?a=b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_load_env_file_missing_is_empty() {
        let pairs = load_env_file(Path::new("/nonexistent/.env")).await.unwrap();
        assert!(pairs.is_empty());
    }
}
