// Remote file path hygiene for the transfer components.
//
// Device filesystems are unforgiving about malformed paths, so every path is
// sanitized (trimmed, rooted) and validated before a transfer is attempted.
// Multi-item calls additionally collapse duplicate paths.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("remote file path is empty or blank")]
    Blank,
    #[error("remote file path '{0}' points to a directory, not a file")]
    PointsToDirectory(String),
    #[error("remote file path '{0}' contains illegal control characters")]
    IllegalCharacters(String),
}

/// Trim surrounding whitespace and root the path with a leading '/'.
pub fn sanitize_remote_file_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn validate_remote_file_path(path: &str) -> Result<(), PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::Blank);
    }
    if trimmed.ends_with('/') {
        return Err(PathError::PointsToDirectory(trimmed.to_string()));
    }
    if trimmed.contains(['\r', '\n', '\x0c']) {
        return Err(PathError::IllegalCharacters(trimmed.to_string()));
    }
    Ok(())
}

/// Sanitize and collapse duplicate upload entries. The last data supplied for
/// a path wins while the path keeps its first-seen position.
pub fn sanitize_and_dedupe_uploads(
    entries: Vec<(String, Vec<u8>)>,
) -> Result<Vec<(String, Vec<u8>)>, PathError> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: std::collections::HashMap<String, Vec<u8>> = std::collections::HashMap::new();

    for (path, data) in entries {
        validate_remote_file_path(&path)?;
        let sanitized = sanitize_remote_file_path(&path);
        if !latest.contains_key(&sanitized) {
            order.push(sanitized.clone());
        }
        latest.insert(sanitized, data);
    }

    Ok(order
        .into_iter()
        .map(|path| {
            let data = latest.remove(&path).unwrap_or_default();
            (path, data)
        })
        .collect())
}

/// Sanitize and collapse duplicate download paths, keeping first-seen order.
pub fn sanitize_unique_remote_paths(paths: &[String]) -> Result<Vec<String>, PathError> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for path in paths {
        validate_remote_file_path(path)?;
        let sanitized = sanitize_remote_file_path(path);
        if seen.insert(sanitized.clone()) {
            result.push(sanitized);
        }
    }
    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_roots_and_trims() {
        assert_eq!(sanitize_remote_file_path("  foo/bar.bin  "), "/foo/bar.bin");
        assert_eq!(sanitize_remote_file_path("/already/rooted"), "/already/rooted");
    }

    #[test]
    fn test_validate_rejects_blank() {
        assert_eq!(validate_remote_file_path("   "), Err(PathError::Blank));
        assert_eq!(validate_remote_file_path(""), Err(PathError::Blank));
    }

    #[test]
    fn test_validate_rejects_directory() {
        assert_eq!(
            validate_remote_file_path("/lfs/logs/"),
            Err(PathError::PointsToDirectory("/lfs/logs/".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_control_characters() {
        assert!(matches!(
            validate_remote_file_path("/a\nb"),
            Err(PathError::IllegalCharacters(_))
        ));
        assert!(matches!(
            validate_remote_file_path("/a\rb"),
            Err(PathError::IllegalCharacters(_))
        ));
    }

    #[test]
    fn test_dedupe_uploads_last_data_wins_first_seen_order() {
        let entries = vec![
            ("/a".to_string(), vec![1]),
            ("/b".to_string(), vec![2]),
            ("/a".to_string(), vec![3]),
        ];
        let result = sanitize_and_dedupe_uploads(entries).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], ("/a".to_string(), vec![3]));
        assert_eq!(result[1], ("/b".to_string(), vec![2]));
    }

    #[test]
    fn test_dedupe_uploads_sanitizes_before_comparing() {
        let entries = vec![
            ("a.bin".to_string(), vec![1]),
            (" /a.bin ".to_string(), vec![2]),
        ];
        let result = sanitize_and_dedupe_uploads(entries).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], ("/a.bin".to_string(), vec![2]));
    }

    #[test]
    fn test_unique_download_paths() {
        let paths = vec![
            "/x".to_string(),
            "y".to_string(),
            " /x".to_string(),
        ];
        let result = sanitize_unique_remote_paths(&paths).unwrap();
        assert_eq!(result, ["/x", "/y"]);
    }
}
