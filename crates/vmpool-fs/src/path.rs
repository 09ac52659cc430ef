//! Path helpers shared by every backend.
//!
//! These work on `/`-separated backend paths as strings, independent of the
//! host platform's separator.

/// Last element of the path. Trailing slashes are ignored; an empty path
/// yields `.` and a path of only slashes yields `/`.
pub fn base_name(name: &str) -> String {
    if name.is_empty() {
        return ".".to_string();
    }
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Everything but the last element of the path.
pub fn dir_name(name: &str) -> String {
    match name.rfind('/') {
        None => ".".to_string(),
        Some(idx) => {
            let dir = name[..idx].trim_end_matches('/');
            if dir.is_empty() {
                "/".to_string()
            } else {
                dir.to_string()
            }
        }
    }
}

/// Extension of the last element, without the leading dot.
pub fn ext_name(name: &str) -> String {
    let base = match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    };
    match base.rfind('.') {
        Some(idx) => base[idx + 1..].to_string(),
        None => String::new(),
    }
}
