//! Shell-style glob matching over the virtual filesystem.
//!
//! Supports `*` and `?` within a single path component; patterns are
//! matched component-wise from the root (or the supplied cwd).

use wasmbox_vfs::{path as vpath, FileSystem};

/// Match one component pattern against one name, with backtracking for
/// `*`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star_p, mut star_t) = (usize::MAX, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star_p = p;
            star_t = t;
            p += 1;
        } else if star_p != usize::MAX {
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Expand `pattern` against the filesystem, resolving relative patterns
/// from `cwd`. Results are absolute paths in listing order.
pub fn glob_walk(fs: &dyn FileSystem, pattern: &str, cwd: &str) -> Vec<String> {
    let absolute = vpath::join(cwd, pattern);
    let components: Vec<String> = vpath::split(&absolute)
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    let mut matches = vec!["/".to_string()];
    for comp in &components {
        let mut next = Vec::new();
        if comp.contains('*') || comp.contains('?') {
            for base in &matches {
                if let Ok(entries) = fs.read_dir(base) {
                    for entry in entries {
                        if glob_match(comp, &entry.name) {
                            next.push(vpath::join(base, &entry.name));
                        }
                    }
                }
            }
        } else {
            for base in &matches {
                let candidate = vpath::join(base, comp);
                if fs.exists(&candidate) {
                    next.push(candidate);
                }
            }
        }
        matches = next;
        if matches.is_empty() {
            break;
        }
    }
    matches
}
