//! Directory entries and file addresses.
//!
//! A `Dir` is a map of string attributes describing one file tree entry.
//! Standard attributes are `name`, `type` (`d` or `-`), `mode` (octal),
//! `size`, `path` and friends; anything else is free-form metadata.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{DecodeError, WireDecode, WireEncode};

/// Preferred print order of standard attributes.
pub const STD_ATTR_ORDER: [&str; 11] = [
    "name", "type", "mode", "size", "mtime", "uid", "gid", "wuid", "path", "addr", "err",
];

/// A directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dir(BTreeMap<String, String>);

impl Dir {
    /// Creates an empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute set.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets an attribute.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Returns an attribute or the empty string.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// Returns true if the attribute is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes an attribute.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The `name` attribute.
    pub fn name(&self) -> &str {
        self.get("name")
    }

    /// The `path` attribute.
    pub fn path(&self) -> &str {
        self.get("path")
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.get("type") == "d"
    }

    /// The `mode` attribute parsed as octal permission bits.
    pub fn mode(&self) -> u32 {
        let m = self.get("mode");
        let m = m.strip_prefix("0").unwrap_or(m);
        u32::from_str_radix(m, 8).unwrap_or(0)
    }

    /// The `size` attribute.
    pub fn size(&self) -> u64 {
        self.get("size").parse().unwrap_or(0)
    }

    /// Sets `mode` as an octal string.
    pub fn set_mode(&mut self, mode: u32) {
        self.set("mode", format!("0{:o}", mode));
    }

    /// Sets `size`.
    pub fn set_size(&mut self, size: u64) {
        self.set("size", size.to_string());
    }
}

impl WireEncode for Dir {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl WireDecode for Dir {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(BTreeMap::decode(buf)?))
    }
}

impl From<BTreeMap<String, String>> for Dir {
    fn from(m: BTreeMap<String, String>) -> Self {
        Self(m)
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for k in STD_ATTR_ORDER {
            if let Some(v) = self.0.get(k) {
                write!(f, "{}{}:{:?}", sep, k, v)?;
                sep = " ";
            }
        }
        for (k, v) in &self.0 {
            if !STD_ATTR_ORDER.contains(&k.as_str()) {
                write!(f, "{}{}:{:?}", sep, k, v)?;
                sep = " ";
            }
        }
        Ok(())
    }
}

/// A file address: a name plus optional line and rune ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    /// File or resource name
    pub name: String,
    /// First line, or zero
    pub ln0: u32,
    /// Last line, or zero
    pub ln1: u32,
    /// First rune, or zero
    pub p0: u32,
    /// Last rune, or zero
    pub p1: u32,
}

impl Addr {
    /// Parses `name[:ln0[,ln1]][:#p0[,#p1]]`.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(':');
        let mut a = Addr {
            name: parts.next().unwrap_or("").to_string(),
            ..Default::default()
        };
        for part in parts {
            if let Some(dot) = part.strip_prefix('#') {
                (a.p0, a.p1) = parse_range(dot);
            } else if !part.is_empty() {
                (a.ln0, a.ln1) = parse_range(part);
            }
        }
        a
    }
}

fn parse_range(s: &str) -> (u32, u32) {
    let mut els = s.splitn(2, ',');
    let num = |x: Option<&str>| x.map(|x| x.trim_start_matches('#').parse().unwrap_or(0));
    let p0 = num(els.next()).unwrap_or(0);
    let p1 = num(els.next()).unwrap_or(p0);
    (p0, p1)
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() { "in" } else { &self.name };
        f.write_str(name)?;
        if self.ln0 != 0 || self.ln1 != 0 {
            if self.ln0 == self.ln1 {
                write!(f, ":{}", self.ln0)?;
            } else {
                write!(f, ":{},{}", self.ln0, self.ln1)?;
            }
            if self.p0 == 0 && self.p1 == 0 {
                return Ok(());
            }
        }
        write!(f, ":#{},#{}", self.p0, self.p1)
    }
}

impl WireEncode for Addr {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        self.ln0.encode(buf);
        self.ln1.encode(buf);
        self.p0.encode(buf);
        self.p1.encode(buf);
    }
}

impl WireDecode for Addr {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Addr {
            name: String::decode(buf)?,
            ln0: u32::decode(buf)?,
            ln1: u32::decode(buf)?,
            p0: u32::decode(buf)?,
            p1: u32::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_attrs() {
        let mut d = Dir::new().with("name", "cmd").with("type", "-");
        d.set_mode(0o644);
        d.set_size(12);
        assert_eq!(d.get("mode"), "0644");
        assert_eq!(d.mode(), 0o644);
        assert_eq!(d.size(), 12);
        assert!(!d.is_dir());
        assert_eq!(d.get("missing"), "");
    }

    #[test]
    fn test_dir_pack() {
        let d = Dir::new().with("name", "x").with("type", "d");
        let b = d.to_bytes();
        assert_eq!(&b[..4], &[2, 0, 0, 0]);
        assert_eq!(Dir::from_bytes(&b).unwrap(), d);
    }

    #[test]
    fn test_dir_display_order() {
        let d = Dir::new()
            .with("zz", "1")
            .with("size", "3")
            .with("name", "a");
        assert_eq!(d.to_string(), "name:\"a\" size:\"3\" zz:\"1\"");
    }

    #[test]
    fn test_addr_parse_print() {
        let cases = [
            ("foo.c", "foo.c:#0,#0"),
            ("foo.c:3", "foo.c:3"),
            ("foo.c:3,5", "foo.c:3,5"),
            (":3,5", "in:3,5"),
            ("foo.c:#3", "foo.c:#3,#3"),
            (":#3,#5", "in:#3,#5"),
            ("foo.c:3,4:#5,#7", "foo.c:3,4:#5,#7"),
        ];
        for (input, want) in cases {
            assert_eq!(Addr::parse(input).to_string(), want, "addr {}", input);
        }
    }

    #[test]
    fn test_addr_pack() {
        let a = Addr {
            name: "a file".into(),
            ln0: 1,
            ln1: 2,
            p0: 3,
            p1: 4,
        };
        let b = a.to_bytes();
        assert_eq!(b.len(), 4 + 6 + 16);
        assert_eq!(Addr::from_bytes(&b).unwrap(), a);
    }
}
