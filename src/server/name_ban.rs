//! Nickname bans
//!
//! A ban matches any name within its edit distance of the banned name, or,
//! for substring bans, any name containing it. Comparison ignores case.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameBan {
    pub name: String,
    pub distance: usize,
    pub is_substring: bool,
    pub reason: String,
}

impl NameBan {
    fn matches(&self, candidate: &str) -> bool {
        let banned = self.name.to_lowercase();
        if self.is_substring && candidate.contains(&banned) {
            return true;
        }
        edit_distance(candidate, &banned) <= self.distance
    }
}

#[derive(Debug, Default)]
pub struct NameBanList {
    bans: Vec<NameBan>,
}

impl NameBanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ban or update the existing one for `ban.name`. Returns the
    /// replaced ban if there was one.
    pub fn upsert(&mut self, ban: NameBan) -> Option<NameBan> {
        match self.bans.iter_mut().find(|b| b.name == ban.name) {
            Some(existing) => Some(std::mem::replace(existing, ban)),
            None => {
                self.bans.push(ban);
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<NameBan> {
        let idx = self.bans.iter().position(|b| b.name == name)?;
        Some(self.bans.remove(idx))
    }

    /// First ban matching `name`
    pub fn find(&self, name: &str) -> Option<&NameBan> {
        let candidate = name.to_lowercase();
        self.bans.iter().find(|ban| ban.matches(&candidate))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NameBan> {
        self.bans.iter()
    }
}

/// Trim surrounding whitespace and reject names that are empty or start
/// with a command prefix
pub fn sanitize_name(name: &str) -> Option<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') {
        None
    } else {
        Some(trimmed)
    }
}

/// Levenshtein distance over characters
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            cur[j + 1] = substitution.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ban(name: &str, distance: usize, is_substring: bool) -> NameBan {
        NameBan {
            name: name.into(),
            distance,
            is_substring,
            reason: String::new(),
        }
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn test_distance_match() {
        let mut bans = NameBanList::new();
        bans.upsert(ban("griefer", 2, false));
        assert!(bans.find("Griefer").is_some());
        assert!(bans.find("gr1efer").is_some());
        assert!(bans.find("friendly").is_none());
    }

    #[test]
    fn test_substring_match() {
        let mut bans = NameBanList::new();
        bans.upsert(ban("spam", 0, true));
        assert!(bans.find("xXspamXx").is_some());
        assert!(bans.find("spa").is_none());
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut bans = NameBanList::new();
        assert!(bans.upsert(ban("a", 0, false)).is_none());
        let old = bans.upsert(ban("a", 1, false)).unwrap();
        assert_eq!(old.distance, 0);
        assert_eq!(bans.iter().count(), 1);
        assert!(bans.remove("a").is_some());
        assert!(bans.remove("a").is_none());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  nameless tee "), Some("nameless tee"));
        assert_eq!(sanitize_name("   "), None);
        assert_eq!(sanitize_name("/kill"), None);
    }
}
