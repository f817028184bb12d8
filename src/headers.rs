/// Ordered header multimap. Lookups are case-insensitive; insertion order
/// and duplicate fields are preserved so a parsed response can be
/// re-serialized the way the server sent it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces the first field with this name, or appends if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        for (k, v) in self.entries.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.into();
                return;
            }
        }
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Joins a continuation line onto the most recently appended field,
    /// per the obsolete line-folding rule (leading SP / HTAB).
    pub fn fold_continuation(&mut self, line: &str) {
        if let Some((_, v)) = self.entries.last_mut() {
            if !v.is_empty() {
                v.push(' ');
            }
            v.push_str(line.trim_start_matches([' ', '\t']));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
