use serde::{Deserialize, Serialize};

use crate::domain::FileDescriptor;

/// Which files of a snapshot to restore. Empty criteria match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileFilter {
    pub domains: Vec<String>,
    pub extensions: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub modified_after: Option<i64>,
    pub modified_before: Option<i64>,
}

impl FileFilter {
    pub fn matches(&self, f: &FileDescriptor) -> bool {
        if !self.domains.is_empty()
            && !self.domains.iter().any(|d| d.eq_ignore_ascii_case(&f.domain))
        {
            return false;
        }
        if !self.extensions.is_empty() {
            let ext = f
                .relative_path
                .rsplit_once('.')
                .map(|(_, e)| e)
                .filter(|e| !e.contains('/'));
            let hit = ext.is_some_and(|e| {
                self.extensions
                    .iter()
                    .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(e))
            });
            if !hit {
                return false;
            }
        }
        if self.min_size.is_some_and(|m| f.size < m) || self.max_size.is_some_and(|m| f.size > m) {
            return false;
        }
        if self.modified_after.is_some_and(|t| f.last_modified < t)
            || self.modified_before.is_some_and(|t| f.last_modified > t)
        {
            return false;
        }
        true
    }

    pub fn apply(&self, files: &[FileDescriptor]) -> Vec<FileDescriptor> {
        files.iter().filter(|f| self.matches(f)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(domain: &str, rel: &str, size: u64, mtime: i64) -> FileDescriptor {
        FileDescriptor {
            signature: Default::default(),
            size,
            relative_path: rel.into(),
            domain: domain.into(),
            mode: 0,
            encryption_key: None,
            decrypted_size: 0,
            last_modified: mtime,
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(FileFilter::default().matches(&fd("X", "a", 1, 1)));
    }

    #[test]
    fn criteria_are_conjunctive() {
        let f = FileFilter {
            domains: vec!["cameraRollDomain".into()],
            extensions: vec![".JPG".into()],
            max_size: Some(100),
            modified_after: Some(10),
            ..Default::default()
        };
        assert!(f.matches(&fd("CameraRollDomain", "Media/DCIM/IMG_1.jpg", 50, 20)));
        assert!(!f.matches(&fd("HomeDomain", "Media/DCIM/IMG_1.jpg", 50, 20)));
        assert!(!f.matches(&fd("CameraRollDomain", "Media/DCIM/IMG_1.mov", 50, 20)));
        assert!(!f.matches(&fd("CameraRollDomain", "Media/DCIM/IMG_1.jpg", 500, 20)));
        assert!(!f.matches(&fd("CameraRollDomain", "Media/DCIM/IMG_1.jpg", 50, 5)));
        assert!(!f.matches(&fd("CameraRollDomain", "Media.d/noext", 50, 20)));
    }
}
