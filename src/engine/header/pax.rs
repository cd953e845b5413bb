use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// PAX extended attributes (key-value pairs).
///
/// Comparison ignores insertion order, encoding follows it so archives are
/// reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaxAttributes {
    attributes: IndexMap<String, String>,
}

impl PaxAttributes {
    /// Creates an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the attribute if present.
    ///
    /// # Arguments
    /// * `key` - The key of the attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Sets an attribute, replacing the value of an existing key in place.
    ///
    /// # Arguments
    /// * `key` - The key of the attribute.
    /// * `value` - The value of the attribute.
    ///
    /// # Returns
    /// * `Option<String>` - The previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.attributes.insert(key.into(), value.into())
    }

    /// Removes the attribute with the specified key.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.attributes.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns an iterator over the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy of `self` with every attribute of `other` set on top.
    ///
    /// # Arguments
    /// * `other` - Attributes that win on conflicting keys.
    pub fn merged_with(&self, other: &PaxAttributes) -> PaxAttributes {
        let mut merged = self.clone();
        for (key, value) in other.iter() {
            merged.insert(key, value);
        }
        merged
    }

    /// Returns the PAX path attribute if present.
    pub fn path(&self) -> Option<&str> {
        self.get("path")
    }

    /// Returns the PAX linkpath attribute if present.
    pub fn linkpath(&self) -> Option<&str> {
        self.get("linkpath")
    }

    /// Returns the PAX size attribute if present and decimal.
    pub fn size(&self) -> Option<u64> {
        self.get_u64("size")
    }

    /// Returns the PAX uid attribute if present and decimal.
    pub fn uid(&self) -> Option<u64> {
        self.get_u64("uid")
    }

    /// Returns the PAX gid attribute if present and decimal.
    pub fn gid(&self) -> Option<u64> {
        self.get_u64("gid")
    }

    /// Returns the PAX uname attribute if present.
    pub fn uname(&self) -> Option<&str> {
        self.get("uname")
    }

    /// Returns the PAX gname attribute if present.
    pub fn gname(&self) -> Option<&str> {
        self.get("gname")
    }

    /// Returns the whole seconds of the PAX mtime attribute, the fraction is dropped.
    pub fn mtime(&self) -> Option<u64> {
        let raw = self.get("mtime")?;
        let seconds = raw.split('.').next().unwrap_or(raw);
        seconds.parse::<u64>().ok()
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse::<u64>().ok()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PaxAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = PaxAttributes::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// Calculates the size of a PAX record, `"<len> <key>=<value>\n"`, where the
/// length prefix counts its own digits.
///
/// # Arguments
///
/// * `key` - The key of the attribute.
/// * `value` - The value of the attribute.
///
/// # Returns
///
/// * `usize` - The size of the record in bytes.
pub(crate) fn calc_line_size(key: &str, value: &str) -> usize {
    // the record without the length prefix, basically: " key=value\n"
    let line_size = key.len() + value.len() + 3;

    // widen the prefix until its digit count stops changing
    let mut total = line_size + digits(line_size);
    loop {
        let next = line_size + digits(total);
        if next == total {
            return total;
        }
        total = next;
    }
}

fn digits(value: usize) -> usize {
    (value.checked_ilog10().unwrap_or(0) + 1) as usize
}

/// Encodes the attributes as PAX records in insertion order.
pub fn encode_pax(attributes: &PaxAttributes) -> Vec<u8> {
    let mut out = Vec::new();
    let mut len_buf = itoa::Buffer::new();
    for (key, value) in attributes.iter() {
        let line_size = calc_line_size(key, value);
        out.extend_from_slice(len_buf.format(line_size).as_bytes());
        out.push(b' ');
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Decodes PAX records.
///
/// Decoding stops at the first record without a usable length or without a
/// `key=value` body, keeping the attributes read so far. Trailing NUL padding
/// ends decoding that way.
pub fn decode_pax(buf: &[u8]) -> PaxAttributes {
    let mut attributes = PaxAttributes::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let len = match std::str::from_utf8(&rest[..space]).ok().and_then(|s| s.parse::<usize>().ok()) {
            Some(len) if len > space + 1 && len <= rest.len() => len,
            _ => {
                if rest.iter().any(|&b| b != 0) {
                    log::warn!("malformed PAX record length, ignoring {} trailing bytes", rest.len());
                }
                break;
            }
        };

        // record body without the length prefix and the trailing newline
        let body_end = if rest[len - 1] == b'\n' { len - 1 } else { len };
        let body = &rest[space + 1..body_end];
        let Some(eq) = body.iter().position(|&b| b == b'=') else {
            log::warn!("malformed PAX record without '=', ignoring the remaining records");
            break;
        };
        let key = String::from_utf8_lossy(&body[..eq]);
        let value = String::from_utf8_lossy(&body[eq + 1..]);
        attributes.insert(key, value);
        rest = &rest[len..];
    }
    attributes
}
