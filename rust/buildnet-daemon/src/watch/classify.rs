//! Path matching and change-impact classification

use super::{ChangeImpact, FileEvent};
use buildnet_config::WatchSection;
use std::collections::BTreeSet;

/// Segment-wise glob match supporting `**`, `*`, and `?`
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let normalized_path = normalize(path);
    let path: Vec<&str> = normalized_path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &path)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches("./")
        .to_string()
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..])),
        Some(segment) => {
            !path.is_empty()
                && match_segment(segment, path[0])
                && match_segments(&pattern[1..], &path[1..])
        }
    }
}

fn match_segment(pattern: &str, segment: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let segment: Vec<char> = segment.chars().collect();
    match_chars(&pattern, &segment)
}

fn match_chars(pattern: &[char], segment: &[char]) -> bool {
    match pattern.first() {
        None => segment.is_empty(),
        Some('*') => (0..=segment.len()).any(|skip| match_chars(&pattern[1..], &segment[skip..])),
        Some('?') => !segment.is_empty() && match_chars(&pattern[1..], &segment[1..]),
        Some(c) => !segment.is_empty() && segment[0] == *c && match_chars(&pattern[1..], &segment[1..]),
    }
}

/// A path matches when it passes all include globs and no exclude globs
pub fn path_included(path: &str, include: &[String], exclude: &[String]) -> bool {
    include.iter().all(|glob| glob_match(glob, path))
        && !exclude.iter().any(|glob| glob_match(glob, path))
}

/// Test, documentation, and lock files are cosmetic
pub fn is_cosmetic(path: &str) -> bool {
    let path = normalize(path);
    let segments: Vec<&str> = path.split('/').collect();
    let Some(file_name) = segments.last() else {
        return false;
    };

    if segments
        .iter()
        .any(|s| matches!(*s, "test" | "tests" | "__tests__" | "doc" | "docs"))
    {
        return true;
    }
    if file_name.ends_with(".md")
        || file_name.ends_with(".mdx")
        || file_name.ends_with(".markdown")
    {
        return true;
    }
    if file_name.ends_with(".lock")
        || *file_name == "package-lock.json"
        || *file_name == "yarn.lock"
    {
        return true;
    }
    file_name.contains(".test.") || file_name.contains(".spec.")
}

/// Top-level package of a path: `packages/<X>/...` or `apps/<X>/...`
pub fn package_of(path: &str) -> Option<String> {
    let path = normalize(path);
    let mut segments = path.split('/');
    match segments.next() {
        Some("packages") | Some("apps") => segments.next().map(str::to_string),
        _ => None,
    }
}

/// Classify a closed batch: impact plus the affected packages
pub fn classify_batch(events: &[FileEvent], config: &WatchSection) -> (ChangeImpact, Vec<String>) {
    let included: Vec<&FileEvent> = events
        .iter()
        .filter(|e| path_included(&e.path, &config.include, &config.exclude))
        .collect();
    if included.is_empty() {
        return (ChangeImpact::Ignored, Vec::new());
    }

    let packages: BTreeSet<String> = included
        .iter()
        .filter_map(|e| package_of(&e.path))
        .collect();
    let package_list: Vec<String> = packages.iter().cloned().collect();

    if included.iter().all(|e| is_cosmetic(&e.path)) {
        return (ChangeImpact::Cosmetic, package_list);
    }

    let shared_root = included.iter().any(|e| package_of(&e.path).is_none());
    let impact = if !shared_root && packages.len() == 1 {
        ChangeImpact::Local
    } else {
        ChangeImpact::Broad
    };
    (impact, package_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::FileEventKind;
    use chrono::Utc;

    fn event(path: &str) -> FileEvent {
        FileEvent {
            path: path.to_string(),
            kind: FileEventKind::Modified,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn glob_double_star_spans_directories() {
        assert!(glob_match("**/node_modules/**", "a/b/node_modules/c/d.js"));
        assert!(glob_match("packages/**", "packages/core/src/index.ts"));
        assert!(!glob_match("packages/**", "apps/web/src/index.ts"));
        assert!(glob_match("**/*.ts", "packages/core/a.ts"));
        assert!(!glob_match("**/*.ts", "packages/core/a.rs"));
        assert!(glob_match("src/?.ts", "src/a.ts"));
    }

    #[test]
    fn excludes_win_over_includes() {
        let include = Vec::new();
        let exclude = vec!["**/dist/**".to_string()];
        assert!(path_included("packages/core/a.ts", &include, &exclude));
        assert!(!path_included("packages/core/dist/a.js", &include, &exclude));
    }

    #[test]
    fn cosmetic_paths_are_detected() {
        assert!(is_cosmetic("packages/core/tests/a.test.ts"));
        assert!(is_cosmetic("docs/guide.md"));
        assert!(is_cosmetic("Cargo.lock"));
        assert!(is_cosmetic("packages/ui/button.spec.tsx"));
        assert!(!is_cosmetic("packages/core/src/index.ts"));
    }

    #[test]
    fn package_extraction() {
        assert_eq!(package_of("packages/core/a.ts"), Some("core".to_string()));
        assert_eq!(package_of("apps/web/a.ts"), Some("web".to_string()));
        assert_eq!(package_of("scripts/build.sh"), None);
    }

    #[test]
    fn all_excluded_is_ignored() {
        let config = WatchSection::default();
        let events = vec![event("packages/core/dist/out.js")];
        let (impact, _) = classify_batch(&events, &config);
        assert_eq!(impact, ChangeImpact::Ignored);
    }

    #[test]
    fn all_cosmetic_is_cosmetic() {
        let config = WatchSection::default();
        let events = vec![event("docs/readme.md"), event("packages/core/tests/a.test.ts")];
        let (impact, _) = classify_batch(&events, &config);
        assert_eq!(impact, ChangeImpact::Cosmetic);
    }

    #[test]
    fn single_package_is_local() {
        let config = WatchSection::default();
        let events = vec![
            event("packages/core/a.ts"),
            event("packages/core/b.ts"),
        ];
        let (impact, packages) = classify_batch(&events, &config);
        assert_eq!(impact, ChangeImpact::Local);
        assert_eq!(packages, vec!["core".to_string()]);
    }

    #[test]
    fn multiple_packages_are_broad() {
        let config = WatchSection::default();
        let events = vec![
            event("packages/core/a.ts"),
            event("packages/ui/x.ts"),
        ];
        let (impact, packages) = classify_batch(&events, &config);
        assert_eq!(impact, ChangeImpact::Broad);
        assert_eq!(packages, vec!["core".to_string(), "ui".to_string()]);
    }

    #[test]
    fn shared_root_is_broad() {
        let config = WatchSection::default();
        let events = vec![event("tsconfig.json")];
        let (impact, _) = classify_batch(&events, &config);
        assert_eq!(impact, ChangeImpact::Broad);
    }

    #[test]
    fn impact_ordering() {
        assert!(ChangeImpact::Broad > ChangeImpact::Local);
        assert!(ChangeImpact::Local > ChangeImpact::Cosmetic);
        assert!(ChangeImpact::Cosmetic > ChangeImpact::Ignored);
    }
}
