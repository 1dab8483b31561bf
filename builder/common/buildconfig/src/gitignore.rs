//! A small gitwildmatch subset used when hashing source trees: the hash must
//! ignore exactly what a checkout ignores, or editor droppings would change
//! the source hash.

use regex::Regex;

struct Pattern {
    regex: Regex,
    dir_only: bool,
    anchored: bool,
}

pub struct GitIgnore {
    patterns: Vec<Pattern>,
}

impl GitIgnore {
    /// Parses `.gitignore` lines. Comments and blanks are skipped; negations
    /// are not supported and are ignored.
    pub fn from_lines<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Self {
        let mut patterns = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let dir_only = line.ends_with('/');
            let line = line.trim_end_matches('/');
            let anchored = line.contains('/');
            let line = line.trim_start_matches('/');
            if let Some(regex) = glob_to_regex(line) {
                patterns.push(Pattern {
                    regex,
                    dir_only,
                    anchored,
                });
            }
        }
        Self { patterns }
    }

    /// Whether the entry at `rel_path` (relative to the directory owning
    /// the ignore file) is ignored.
    pub fn matches(&self, rel_path: &str, is_dir: bool) -> bool {
        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.patterns.iter().any(|pattern| {
            if pattern.dir_only && !is_dir {
                return false;
            }
            let candidate = if pattern.anchored { rel_path } else { basename };
            pattern.regex.is_match(candidate)
        })
    }
}

fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_basename_patterns_anywhere() {
        let ignore = GitIgnore::from_lines(["*.pyc", "# comment", ""]);
        assert!(ignore.matches("module.pyc", false));
        assert!(ignore.matches("deep/nested/module.pyc", false));
        assert!(!ignore.matches("module.py", false));
    }

    #[test]
    fn dir_only_patterns() {
        let ignore = GitIgnore::from_lines(["build/"]);
        assert!(ignore.matches("build", true));
        assert!(!ignore.matches("build", false));
    }

    #[test]
    fn anchored_patterns() {
        let ignore = GitIgnore::from_lines(["/dist", "pkg/generated"]);
        assert!(ignore.matches("dist", true));
        assert!(!ignore.matches("sub/dist", true));
        assert!(ignore.matches("pkg/generated", false));
    }
}
