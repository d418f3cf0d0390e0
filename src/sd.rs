//! Dynamic structured data values.
//!
//! [`Sd`] is the unit of meta-data flowing through the framework: chain
//! contexts, RPC parameters and results, HTTP header maps. It is a closed
//! set of scalar and container variants matching the notation wire format
//! in [`crate::notation`].
//!
//! Maps preserve insertion order. HTTP response headers are emitted in the
//! order the handler recorded them, so the map cannot be a sorted or
//! hashed container.

use time::OffsetDateTime;
use uuid::Uuid;

static UNDEF: Sd = Sd::Undef;

#[derive(Clone, Debug, PartialEq)]
pub enum Sd {
    Undef,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Uuid(Uuid),
    Date(OffsetDateTime),
    Uri(String),
    Binary(Vec<u8>),
    /// Key/value pairs in insertion order.
    Map(Vec<(String, Sd)>),
    Array(Vec<Sd>),
}

impl Default for Sd {
    fn default() -> Self {
        Sd::Undef
    }
}

impl Sd {
    #[inline]
    pub fn is_undef(&self) -> bool {
        matches!(self, Sd::Undef)
    }

    #[inline]
    pub fn is_defined(&self) -> bool {
        !self.is_undef()
    }

    #[inline]
    pub fn is_map(&self) -> bool {
        matches!(self, Sd::Map(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Sd::Array(_))
    }

    /// String view of the value. Non-string variants read as `""`.
    pub fn as_str(&self) -> &str {
        match self {
            Sd::String(s) | Sd::Uri(s) => s,
            _ => "",
        }
    }

    pub fn as_int(&self) -> i32 {
        match self {
            Sd::Integer(v) => *v,
            Sd::Real(v) => *v as i32,
            Sd::Boolean(true) => 1,
            _ => 0,
        }
    }

    pub fn as_real(&self) -> f64 {
        match self {
            Sd::Real(v) => *v,
            Sd::Integer(v) => *v as f64,
            Sd::Boolean(true) => 1.0,
            _ => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Sd::Boolean(v) => *v,
            Sd::Integer(v) => *v != 0,
            Sd::Real(v) => *v != 0.0,
            Sd::String(s) => !s.is_empty(),
            _ => false,
        }
    }

    /// Number of entries of a container, zero for scalars.
    pub fn len(&self) -> usize {
        match self {
            Sd::Map(entries) => entries.len(),
            Sd::Array(values) => values.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Sd> {
        match self {
            Sd::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Map lookup that reads missing keys (and non-maps) as undef.
    pub fn at(&self, key: &str) -> &Sd {
        self.get(key).unwrap_or(&UNDEF)
    }

    /// Mutable map lookup. Converts an undef value into an empty map and
    /// inserts an undef entry for a missing key, so nested contexts can be
    /// built up with `context.at_mut("request").insert("verb", ...)`.
    pub fn at_mut(&mut self, key: &str) -> &mut Sd {
        if !self.is_map() {
            *self = Sd::Map(Vec::new());
        }
        let entries = match self {
            Sd::Map(entries) => entries,
            _ => unreachable!(),
        };
        if let Some(index) = entries.iter().position(|(k, _)| k == key) {
            &mut entries[index].1
        } else {
            entries.push((key.to_string(), Sd::Undef));
            let index = entries.len() - 1;
            &mut entries[index].1
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Sd>) {
        *self.at_mut(key) = value.into();
    }

    pub fn map_iter(&self) -> impl Iterator<Item = (&str, &Sd)> {
        let entries: &[(String, Sd)] = match self {
            Sd::Map(entries) => entries,
            _ => &[],
        };
        entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn array_iter(&self) -> impl Iterator<Item = &Sd> {
        let values: &[Sd] = match self {
            Sd::Array(values) => values,
            _ => &[],
        };
        values.iter()
    }

    /// Array element access, undef past the end or on non-arrays.
    pub fn index(&self, index: usize) -> &Sd {
        match self {
            Sd::Array(values) => values.get(index).unwrap_or(&UNDEF),
            _ => &UNDEF,
        }
    }

    pub fn push(&mut self, value: impl Into<Sd>) {
        if !self.is_array() {
            *self = Sd::Array(Vec::new());
        }
        if let Sd::Array(values) = self {
            values.push(value.into());
        }
    }
}

impl From<bool> for Sd {
    fn from(v: bool) -> Sd {
        Sd::Boolean(v)
    }
}

impl From<i32> for Sd {
    fn from(v: i32) -> Sd {
        Sd::Integer(v)
    }
}

impl From<f64> for Sd {
    fn from(v: f64) -> Sd {
        Sd::Real(v)
    }
}

impl From<&str> for Sd {
    fn from(v: &str) -> Sd {
        Sd::String(v.to_string())
    }
}

impl From<String> for Sd {
    fn from(v: String) -> Sd {
        Sd::String(v)
    }
}

impl From<Uuid> for Sd {
    fn from(v: Uuid) -> Sd {
        Sd::Uuid(v)
    }
}

impl From<Vec<u8>> for Sd {
    fn from(v: Vec<u8>) -> Sd {
        Sd::Binary(v)
    }
}

impl From<Vec<Sd>> for Sd {
    fn from(v: Vec<Sd>) -> Sd {
        Sd::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_reads_missing_as_undef() {
        let mut sd = Sd::Undef;
        sd.insert("name", "pump");
        assert_eq!(sd.at("name").as_str(), "pump");
        assert!(sd.at("missing").is_undef());
        assert!(sd.at("name").at("nested").is_undef());
    }

    #[test]
    fn at_mut_builds_nested_maps() {
        let mut context = Sd::Undef;
        context.at_mut("request").insert("verb", "GET");
        context.at_mut("request").insert("path", "/echo");
        assert_eq!(context.at("request").at("verb").as_str(), "GET");
        assert_eq!(context.at("request").at("path").as_str(), "/echo");
        assert_eq!(context.at("request").len(), 2);
    }

    #[test]
    fn map_preserves_insertion_order() {
        let mut sd = Sd::Undef;
        sd.insert("zebra", 1);
        sd.insert("apple", 2);
        sd.insert("mango", 3);
        let keys: Vec<&str> = sd.map_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zebra", "apple", "mango"]);
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(Sd::Integer(7).as_int(), 7);
        assert_eq!(Sd::Integer(7).as_real(), 7.0);
        assert!(Sd::Integer(7).as_bool());
        assert_eq!(Sd::Boolean(true).as_int(), 1);
        assert_eq!(Sd::Undef.as_str(), "");
    }
}
