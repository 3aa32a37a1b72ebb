//! Argument paths.
//!
//! Fragments address a location inside a component's props with a
//! JSON-pointer-like string: `/items/0/name`, `items/0/name`, or the empty
//! string for the root.  `~1` decodes to `/` and `~0` to `~`.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Seg {
    Key(String),
    Index(usize),
}

impl Seg {
    /// Key form, used when the segment addresses an object property.
    /// A numeric segment under an object is an ordinary key.
    pub fn to_key(&self) -> String {
        match self {
            Seg::Key(k) => k.clone(),
            Seg::Index(i) => i.to_string(),
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Seg::Index(i) => Some(*i),
            Seg::Key(_) => None,
        }
    }
}

impl fmt::Display for Seg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seg::Key(k) => f.write_str(&k.replace('~', "~0").replace('/', "~1")),
            Seg::Index(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArgPath(Vec<Seg>);

impl ArgPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            return Self::root();
        }
        Self(
            trimmed
                .split('/')
                .map(|part| {
                    if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(i) = part.parse() {
                            return Seg::Index(i);
                        }
                    }
                    Seg::Key(part.replace("~1", "/").replace("~0", "~"))
                })
                .collect(),
        )
    }

    pub fn segments(&self) -> &[Seg] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A new path with `seg` appended.
    pub fn child(&self, seg: Seg) -> Self {
        let mut segs = self.0.clone();
        segs.push(seg);
        Self(segs)
    }
}

impl fmt::Display for ArgPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl From<&str> for ArgPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_optional() {
        assert_eq!(ArgPath::parse("/a/b/0"), ArgPath::parse("a/b/0"));
        assert_eq!(
            ArgPath::parse("a/b/0").segments(),
            &[Seg::Key("a".into()), Seg::Key("b".into()), Seg::Index(0)]
        );
    }

    #[test]
    fn empty_is_root() {
        assert!(ArgPath::parse("").is_root());
        assert!(ArgPath::parse("/").is_root());
        assert_eq!(ArgPath::root().to_string(), "/");
    }

    #[test]
    fn escapes_round_trip_through_display() {
        let path = ArgPath::parse("/a~1b/c~0d");
        assert_eq!(
            path.segments(),
            &[Seg::Key("a/b".into()), Seg::Key("c~d".into())]
        );
        assert_eq!(path.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn numeric_segment_doubles_as_key() {
        let path = ArgPath::parse("/42");
        assert_eq!(path.segments()[0].as_index(), Some(42));
        assert_eq!(path.segments()[0].to_key(), "42");
    }
}
